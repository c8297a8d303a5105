//! Kernel tables as key/value rows.
//!
//! At commit the runtime hands the crank's journal to [`KernelState::kv_writes`],
//! which works out which keys the crank touched and reads their final values
//! from the post-crank state. A key written and deleted inside one crank is
//! emitted once, as a delete.
//!
//! ```text
//! ko20.owner = v1              kp40.state = unresolved|fulfilled|rejected
//! ko20.refCount = 1,1          kp40.decider / .subscribers / .queue
//! kd30.owner = d7              kp40.data.body / .data.slots / .refCount
//! v1.c.ko20 = R o-50           v1.c.o-50 = ko20
//! v1.o.nextID = 51             runQueue.<pos> = {json}  runQueue.head/tail
//! v1.name / .options / .status / .incarnation / .bundle / .dirt
//! v1.vs.<key> = <value>        d7.name
//! pinnedObjects = ko20,ko21    kernelHeld = kp40
//! vat.nextID  device.nextID  ko.nextID  kd.nextID  kp.nextID  crankNumber
//! ```

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use serde::Serialize;

use crate::error::{KernelError, KernelResult};
use crate::state::{KernelState, StateChange};
use crate::types::{DeviceId, KRef, Participant, RefType, VRef, VatId};

/// One key (or fixed group of keys) a crank may have touched.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Touched {
    Object(KRef),
    DeviceNode(KRef),
    Promise(KRef),
    CListKref(Participant, KRef),
    CListVref(Participant, VRef),
    ImportCounters(Participant),
    RunQueueEntry(u64),
    RunQueueBounds,
    Vat(VatId),
    Device(DeviceId),
    Vatstore(VatId, String),
    Pinned,
    Held,
    Counters,
    Crank,
}

fn to_json<T: Serialize>(value: &T) -> KernelResult<String> {
    serde_json::to_string(value).map_err(|e| KernelError::corrupt(format!("encode: {}", e)))
}

fn comma_list<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn touched_by(change: &StateChange, out: &mut BTreeSet<Touched>) {
    match change {
        StateChange::ObjectCreated { kref, .. }
        | StateChange::ObjectCounts { kref, .. }
        | StateChange::ObjectOwnerCleared { kref }
        | StateChange::ObjectDeleted { kref } => {
            out.insert(Touched::Object(*kref));
            if matches!(change, StateChange::ObjectCreated { .. }) {
                out.insert(Touched::Counters);
            }
        }
        StateChange::DeviceNodeCreated { kref, .. } => {
            out.insert(Touched::DeviceNode(*kref));
            out.insert(Touched::Counters);
        }
        StateChange::PromiseCreated { kpid, .. } => {
            out.insert(Touched::Promise(*kpid));
            out.insert(Touched::Counters);
        }
        StateChange::PromiseDecider { kpid, .. }
        | StateChange::PromiseSubscribed { kpid, .. }
        | StateChange::PromiseEnqueued { kpid, .. }
        | StateChange::PromiseQueueCleared { kpid }
        | StateChange::PromiseResolved { kpid, .. }
        | StateChange::PromiseRefCount { kpid, .. }
        | StateChange::PromiseDeleted { kpid } => {
            out.insert(Touched::Promise(*kpid));
        }
        StateChange::CListAdded {
            participant,
            kref,
            vref,
            ..
        } => {
            out.insert(Touched::CListKref(*participant, *kref));
            out.insert(Touched::CListVref(*participant, *vref));
            if !vref.allocated_by_vat {
                out.insert(Touched::ImportCounters(*participant));
            }
        }
        StateChange::CListReachable {
            participant, kref, ..
        } => {
            out.insert(Touched::CListKref(*participant, *kref));
        }
        StateChange::CListRemoved {
            participant,
            kref,
            vref,
        } => {
            out.insert(Touched::CListKref(*participant, *kref));
            out.insert(Touched::CListVref(*participant, *vref));
        }
        StateChange::RunQueuePushed { pos, .. } | StateChange::RunQueuePopped { pos } => {
            out.insert(Touched::RunQueueEntry(*pos));
            out.insert(Touched::RunQueueBounds);
        }
        StateChange::VatCreated { vat, .. } => {
            out.insert(Touched::Vat(*vat));
            out.insert(Touched::ImportCounters(Participant::Vat(*vat)));
            out.insert(Touched::Counters);
        }
        StateChange::VatStatusChanged { vat, .. }
        | StateChange::VatIncarnation { vat, .. }
        | StateChange::VatDirt { vat, .. } => {
            out.insert(Touched::Vat(*vat));
        }
        StateChange::DeviceCreated { device, .. } => {
            out.insert(Touched::Device(*device));
            out.insert(Touched::ImportCounters(Participant::Device(*device)));
            out.insert(Touched::Counters);
        }
        StateChange::VatstoreSet { vat, key, .. } | StateChange::VatstoreDeleted { vat, key } => {
            out.insert(Touched::Vatstore(*vat, key.clone()));
        }
        StateChange::VatstoreCleared { vat, keys } => {
            for key in keys {
                out.insert(Touched::Vatstore(*vat, key.clone()));
            }
        }
        StateChange::ObjectPinned { .. } => {
            out.insert(Touched::Pinned);
        }
        StateChange::KernelHold { .. } => {
            out.insert(Touched::Held);
        }
        StateChange::CrankFinished { .. } => {
            out.insert(Touched::Crank);
        }
    }
}

type Rows = BTreeMap<String, Option<String>>;

impl KernelState {
    /// The key/value writes that persist `changes`, in key order.
    ///
    /// `None` deletes the key.
    pub fn kv_writes(&self, changes: &[StateChange]) -> KernelResult<Vec<(String, Option<String>)>> {
        let mut touched = BTreeSet::new();
        for change in changes {
            touched_by(change, &mut touched);
        }
        let mut rows = Rows::new();
        for t in &touched {
            self.emit(t, &mut rows)?;
        }
        Ok(rows.into_iter().collect())
    }

    /// Every key the current state persists to.
    pub fn kv_snapshot(&self) -> KernelResult<Vec<(String, String)>> {
        let mut touched = BTreeSet::new();
        touched.extend(self.objects.keys().map(|k| Touched::Object(*k)));
        touched.extend(self.device_nodes.keys().map(|k| Touched::DeviceNode(*k)));
        touched.extend(self.promises.keys().map(|k| Touched::Promise(*k)));
        for (participant, clist) in &self.clists {
            touched.insert(Touched::ImportCounters(*participant));
            for (kref, entry) in clist.entries() {
                touched.insert(Touched::CListKref(*participant, *kref));
                touched.insert(Touched::CListVref(*participant, entry.vref));
            }
        }
        let tail = self.run_queue_head + self.run_queue.len() as u64;
        touched.extend((self.run_queue_head..tail).map(Touched::RunQueueEntry));
        touched.insert(Touched::RunQueueBounds);
        touched.extend(self.vats.keys().map(|v| Touched::Vat(*v)));
        touched.extend(self.devices.keys().map(|d| Touched::Device(*d)));
        for (vat, store) in &self.vatstore {
            touched.extend(store.keys().map(|k| Touched::Vatstore(*vat, k.clone())));
        }
        touched.insert(Touched::Pinned);
        touched.insert(Touched::Held);
        touched.insert(Touched::Counters);
        touched.insert(Touched::Crank);

        let mut rows = Rows::new();
        for t in &touched {
            self.emit(t, &mut rows)?;
        }
        Ok(rows
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    fn emit(&self, touched: &Touched, rows: &mut Rows) -> KernelResult<()> {
        match touched {
            Touched::Object(kref) => {
                let obj = self.objects.get(kref);
                rows.insert(
                    format!("{}.owner", kref),
                    obj.and_then(|o| o.owner).map(|v| v.to_string()),
                );
                rows.insert(
                    format!("{}.refCount", kref),
                    obj.map(|o| o.counts.to_string()),
                );
            }
            Touched::DeviceNode(kref) => {
                rows.insert(
                    format!("{}.owner", kref),
                    self.device_nodes.get(kref).map(|d| d.to_string()),
                );
            }
            Touched::Promise(kpid) => self.emit_promise(*kpid, rows)?,
            Touched::CListKref(participant, kref) => {
                let entry = self.clists.get(participant).and_then(|c| c.get(kref));
                rows.insert(
                    format!("{}.c.{}", participant, kref),
                    entry.map(|e| e.encode()),
                );
            }
            Touched::CListVref(participant, vref) => {
                let kref = self.clists.get(participant).and_then(|c| c.kref_for(vref));
                rows.insert(
                    format!("{}.c.{}", participant, vref),
                    kref.map(|k| k.to_string()),
                );
            }
            Touched::ImportCounters(participant) => {
                if let Some(clist) = self.clists.get(participant) {
                    for (letter, ref_type) in [
                        ('o', RefType::Object),
                        ('p', RefType::Promise),
                        ('d', RefType::Device),
                    ] {
                        rows.insert(
                            format!("{}.{}.nextID", participant, letter),
                            Some(clist.next_import_id(ref_type).to_string()),
                        );
                    }
                }
            }
            Touched::RunQueueEntry(pos) => {
                let value = pos
                    .checked_sub(self.run_queue_head)
                    .and_then(|i| self.run_queue.get(i as usize))
                    .map(to_json)
                    .transpose()?;
                rows.insert(format!("runQueue.{}", pos), value);
            }
            Touched::RunQueueBounds => {
                let tail = self.run_queue_head + self.run_queue.len() as u64;
                rows.insert("runQueue.head".into(), Some(self.run_queue_head.to_string()));
                rows.insert("runQueue.tail".into(), Some(tail.to_string()));
            }
            Touched::Vat(vat) => {
                if let Some(record) = self.vats.get(vat) {
                    rows.insert(format!("{}.name", vat), Some(record.name.clone()));
                    rows.insert(format!("{}.options", vat), Some(to_json(&record.options)?));
                    rows.insert(format!("{}.status", vat), Some(record.status.as_str().into()));
                    rows.insert(
                        format!("{}.incarnation", vat),
                        Some(record.incarnation.to_string()),
                    );
                    rows.insert(format!("{}.bundle", vat), Some(record.bundle.clone()));
                    rows.insert(
                        format!("{}.dirt", vat),
                        Some(record.deliveries_since_reap.to_string()),
                    );
                }
            }
            Touched::Device(device) => {
                if let Some(record) = self.devices.get(device) {
                    rows.insert(format!("{}.name", device), Some(record.name.clone()));
                }
            }
            Touched::Vatstore(vat, key) => {
                rows.insert(
                    format!("{}.vs.{}", vat, key),
                    self.vatstore_get(vat, key).cloned(),
                );
            }
            Touched::Pinned => {
                rows.insert("pinnedObjects".into(), Some(comma_list(self.pinned.iter())));
            }
            Touched::Held => {
                rows.insert("kernelHeld".into(), Some(comma_list(self.kernel_held.iter())));
            }
            Touched::Counters => {
                for (key, value) in [
                    ("vat.nextID", self.next_vat_id),
                    ("device.nextID", self.next_device_id),
                    ("ko.nextID", self.next_object_id),
                    ("kd.nextID", self.next_devnode_id),
                    ("kp.nextID", self.next_promise_id),
                ] {
                    rows.insert(key.into(), Some(value.to_string()));
                }
            }
            Touched::Crank => {
                rows.insert("crankNumber".into(), Some(self.crank_number.to_string()));
            }
        }
        Ok(())
    }

    fn emit_promise(&self, kpid: KRef, rows: &mut Rows) -> KernelResult<()> {
        let key = |field: &str| format!("{}.{}", kpid, field);
        let Some(p) = self.promises.get(&kpid) else {
            for field in [
                "state",
                "decider",
                "subscribers",
                "queue",
                "data.body",
                "data.slots",
                "refCount",
            ] {
                rows.insert(key(field), None);
            }
            return Ok(());
        };

        rows.insert(key("state"), Some(p.state.as_str().into()));
        rows.insert(key("refCount"), Some(p.refcount.to_string()));
        rows.insert(key("decider"), p.decider.map(|v| v.to_string()));
        if p.is_unresolved() {
            rows.insert(key("subscribers"), Some(comma_list(p.subscribers.iter())));
            rows.insert(key("queue"), Some(to_json(&p.queue)?));
        } else {
            rows.insert(key("subscribers"), None);
            rows.insert(key("queue"), None);
        }
        match &p.data {
            Some(data) => {
                rows.insert(key("data.body"), Some(data.body.clone()));
                rows.insert(key("data.slots"), Some(comma_list(data.slots.iter())));
            }
            None => {
                rows.insert(key("data.body"), None);
                rows.insert(key("data.slots"), None);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::VatOptions;
    use crate::translate::MapOptions;
    use crate::types::CapData;
    use alloc::vec;

    fn apply_writes(store: &mut BTreeMap<String, String>, writes: Vec<(String, Option<String>)>) {
        for (key, value) in writes {
            match value {
                Some(v) => {
                    store.insert(key, v);
                }
                None => {
                    store.remove(&key);
                }
            }
        }
    }

    #[test]
    fn test_create_vat_rows() {
        let mut state = KernelState::new();
        state
            .create_vat("alice", "bundle-a", VatOptions::default(), CapData::bare("#{}"))
            .unwrap();
        let journal = state.take_journal();
        let writes: BTreeMap<_, _> = state.kv_writes(&journal).unwrap().into_iter().collect();

        assert_eq!(writes["v1.name"], Some("alice".into()));
        assert_eq!(writes["v1.status"], Some("starting".into()));
        assert_eq!(writes["v1.c.ko20"], Some("R o+0".into()));
        assert_eq!(writes["v1.c.o+0"], Some("ko20".into()));
        assert_eq!(writes["ko20.owner"], Some("v1".into()));
        assert_eq!(writes["ko20.refCount"], Some("1,1".into()));
        assert_eq!(writes["pinnedObjects"], Some("ko20".into()));
        assert_eq!(writes["v1.o.nextID"], Some("50".into()));
        assert_eq!(writes["vat.nextID"], Some("2".into()));
        assert_eq!(writes["runQueue.head"], Some("0".into()));
        assert_eq!(writes["runQueue.tail"], Some("1".into()));
        assert!(writes["runQueue.0"].as_deref().unwrap().contains("startVat"));
    }

    #[test]
    fn test_deleted_rows_become_deletes() {
        let mut state = KernelState::new();
        let kp = state.add_kernel_promise(None).unwrap();
        state.hold_kpid(kp).unwrap();
        state.take_journal();

        state.release_kpid(kp).unwrap();
        state.process_refcounts().unwrap();
        let journal = state.take_journal();
        let writes: BTreeMap<_, _> = state.kv_writes(&journal).unwrap().into_iter().collect();

        assert_eq!(writes["kp40.state"], None);
        assert_eq!(writes["kp40.refCount"], None);
        assert_eq!(writes["kernelHeld"], Some("".into()));
    }

    #[test]
    fn test_settled_promise_rows() {
        let mut state = KernelState::new();
        let kp = state.add_kernel_promise(None).unwrap();
        state.hold_kpid(kp).unwrap();
        state
            .resolve_kernel_promise(kp, true, CapData::bare("#\"boom\""))
            .unwrap();
        let journal = state.take_journal();
        let writes: BTreeMap<_, _> = state.kv_writes(&journal).unwrap().into_iter().collect();

        assert_eq!(writes["kp40.state"], Some("rejected".into()));
        assert_eq!(writes["kp40.data.body"], Some("#\"boom\"".into()));
        assert_eq!(writes["kp40.data.slots"], Some("".into()));
        assert_eq!(writes["kp40.queue"], None);
        assert_eq!(writes["kp40.decider"], None);
    }

    #[test]
    fn test_incremental_writes_match_snapshot() {
        let mut state = KernelState::new();
        let mut store: BTreeMap<String, String> = state.kv_snapshot().unwrap().into_iter().collect();

        let (a, _) = state
            .create_vat("alice", "b", VatOptions::default(), CapData::bare("#{}"))
            .unwrap();
        let (b, root_b) = state
            .create_vat("bob", "b", VatOptions::default(), CapData::bare("#{}"))
            .unwrap();
        let journal = state.take_journal();
        apply_writes(&mut store, state.kv_writes(&journal).unwrap());

        // alice imports bob's root, then sends it a fresh export
        let vref = state
            .map_kernel_slot_to_vat(Participant::Vat(a), root_b, MapOptions::DEFAULT)
            .unwrap();
        state
            .vat_syscall(
                a,
                &crate::syscall::VatSyscall::Send {
                    target: vref,
                    msg: crate::types::Message::new(
                        CapData::new("#[\"hi\",[]]", vec![VRef::object_export(3)]),
                        Some(VRef::promise_export(1)),
                    ),
                },
            )
            .unwrap();
        state
            .vat_syscall(
                b,
                &crate::syscall::VatSyscall::VatstoreSet {
                    key: "count".into(),
                    value: "1".into(),
                },
            )
            .unwrap();
        state.pop_run_queue().unwrap();
        state.process_refcounts().unwrap();
        state.flush_gc_actions().unwrap();
        let journal = state.take_journal();
        apply_writes(&mut store, state.kv_writes(&journal).unwrap());

        state.terminate_vat(b).unwrap();
        state.process_refcounts().unwrap();
        state.flush_gc_actions().unwrap();
        let journal = state.take_journal();
        apply_writes(&mut store, state.kv_writes(&journal).unwrap());

        let snapshot: BTreeMap<String, String> = state.kv_snapshot().unwrap().into_iter().collect();
        assert_eq!(store, snapshot);
        assert!(!store.contains_key("v2.vs.count"));
    }
}
