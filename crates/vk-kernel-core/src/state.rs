//! Kernel state - pure data structure holding all kernel state
//!
//! `KernelState` holds every table the kernel owns. It has NO store, sandbox
//! or logging dependency; the runtime wrapper (`vk-kernel`) persists it.
//!
//! # Journal
//!
//! Every mutation goes through [`KernelState::record`], which applies a
//! [`StateChange`] and appends it to the journal. At crank end the runtime
//! drains the journal into the commit log and the key/value store. Replaying
//! the same changes onto a fresh state reproduces the same state hash.
//!
//! ```text
//!   record(change) ──▶ apply(change) ──▶ tables
//!          │
//!          └──────────▶ journal ──(crank end)──▶ CommitLog + KV writes
//! ```
//!
//! A crank savepoint is simply a clone of the whole state (journal included),
//! so rolling back a crank also forgets its journal entries.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use vk_axiom::{CommitId, CommitPayload, CrankNum, ReplayError, ReplayResult, Replayable, StateHasher};

use crate::clist::CList;
use crate::error::{KernelError, KernelResult};
use crate::lifecycle::{DeviceRecord, VatRecord, VatStatus};
use crate::object::{KernelObject, KernelPromise, PromiseState};
use crate::queue::{GcAction, RunQueueItem};
use crate::types::{
    CapData, DeviceId, KRef, Message, Participant, RefCounts, VRef, VatId, FIRST_DEVICE_ID,
    FIRST_DEVNODE_ID, FIRST_OBJECT_ID, FIRST_PROMISE_ID, FIRST_VAT_ID,
};

// ============================================================================
// State changes
// ============================================================================

/// One journaled state mutation.
///
/// These are the commit payloads of the kernel's commit log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum StateChange {
    ObjectCreated {
        kref: KRef,
        owner: VatId,
    },
    ObjectCounts {
        kref: KRef,
        counts: RefCounts,
    },
    ObjectOwnerCleared {
        kref: KRef,
    },
    ObjectDeleted {
        kref: KRef,
    },
    DeviceNodeCreated {
        kref: KRef,
        owner: DeviceId,
    },
    PromiseCreated {
        kpid: KRef,
        decider: Option<VatId>,
    },
    PromiseDecider {
        kpid: KRef,
        decider: Option<VatId>,
    },
    PromiseSubscribed {
        kpid: KRef,
        vat: VatId,
    },
    PromiseEnqueued {
        kpid: KRef,
        msg: Message,
    },
    PromiseQueueCleared {
        kpid: KRef,
    },
    PromiseResolved {
        kpid: KRef,
        rejected: bool,
        data: CapData,
    },
    PromiseRefCount {
        kpid: KRef,
        refcount: u32,
    },
    PromiseDeleted {
        kpid: KRef,
    },
    CListAdded {
        participant: Participant,
        kref: KRef,
        vref: VRef,
        reachable: bool,
    },
    CListReachable {
        participant: Participant,
        kref: KRef,
        reachable: bool,
    },
    CListRemoved {
        participant: Participant,
        kref: KRef,
        vref: VRef,
    },
    RunQueuePushed {
        pos: u64,
        item: RunQueueItem,
    },
    RunQueuePopped {
        pos: u64,
    },
    VatCreated {
        vat: VatId,
        record: VatRecord,
    },
    VatStatusChanged {
        vat: VatId,
        status: VatStatus,
    },
    VatIncarnation {
        vat: VatId,
        incarnation: u64,
        bundle: String,
    },
    VatDirt {
        vat: VatId,
        deliveries: u64,
    },
    DeviceCreated {
        device: DeviceId,
        record: DeviceRecord,
    },
    VatstoreSet {
        vat: VatId,
        key: String,
        value: String,
    },
    VatstoreDeleted {
        vat: VatId,
        key: String,
    },
    VatstoreCleared {
        vat: VatId,
        keys: Vec<String>,
    },
    ObjectPinned {
        kref: KRef,
    },
    KernelHold {
        kpid: KRef,
        held: bool,
    },
    CrankFinished {
        crank: CrankNum,
    },
}

impl CommitPayload for StateChange {
    fn digest(&self, hasher: &mut StateHasher) {
        hasher.write_json(self);
    }
}

// ============================================================================
// Kernel state
// ============================================================================

/// The pure kernel state - no store, no sandbox, no side effects.
#[derive(Clone, Debug)]
pub struct KernelState {
    /// Kernel objects (`ko<N>`)
    pub(crate) objects: BTreeMap<KRef, KernelObject>,
    /// Kernel promises (`kp<N>`)
    pub(crate) promises: BTreeMap<KRef, KernelPromise>,
    /// Device nodes (`kd<N>`) and the device that owns each
    pub(crate) device_nodes: BTreeMap<KRef, DeviceId>,
    /// One c-list per vat and per device
    pub(crate) clists: BTreeMap<Participant, CList>,
    /// Vat table, terminated vats included
    pub(crate) vats: BTreeMap<VatId, VatRecord>,
    /// Device table
    pub(crate) devices: BTreeMap<DeviceId, DeviceRecord>,
    /// Per-vat key/value storage
    pub(crate) vatstore: BTreeMap<VatId, BTreeMap<String, String>>,
    /// Objects the host pinned; never collected
    pub(crate) pinned: BTreeSet<KRef>,
    /// Promises the host holds a reference to
    pub(crate) kernel_held: BTreeSet<KRef>,
    /// FIFO run queue
    pub(crate) run_queue: VecDeque<RunQueueItem>,
    /// Position of `run_queue[0]`
    pub(crate) run_queue_head: u64,
    pub(crate) next_vat_id: u64,
    pub(crate) next_device_id: u64,
    pub(crate) next_object_id: u64,
    pub(crate) next_devnode_id: u64,
    pub(crate) next_promise_id: u64,
    /// Number of cranks committed so far
    pub(crate) crank_number: CrankNum,

    // Transient, per-crank: not hashed, not persisted
    /// Krefs whose counts dropped this crank
    pub(crate) maybe_free: BTreeSet<KRef>,
    /// GC actions waiting to be grouped onto the run queue
    pub(crate) pending_gc: BTreeSet<GcAction>,
    /// Changes recorded since the last drain
    journal: Vec<StateChange>,
}

impl KernelState {
    /// Create a new empty kernel state.
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            promises: BTreeMap::new(),
            device_nodes: BTreeMap::new(),
            clists: BTreeMap::new(),
            vats: BTreeMap::new(),
            devices: BTreeMap::new(),
            vatstore: BTreeMap::new(),
            pinned: BTreeSet::new(),
            kernel_held: BTreeSet::new(),
            run_queue: VecDeque::new(),
            run_queue_head: 0,
            next_vat_id: FIRST_VAT_ID,
            next_device_id: FIRST_DEVICE_ID,
            next_object_id: FIRST_OBJECT_ID,
            next_devnode_id: FIRST_DEVNODE_ID,
            next_promise_id: FIRST_PROMISE_ID,
            crank_number: 0,
            maybe_free: BTreeSet::new(),
            pending_gc: BTreeSet::new(),
            journal: Vec::new(),
        }
    }

    // ========================================================================
    // Journal
    // ========================================================================

    /// Apply a change and journal it.
    pub fn record(&mut self, change: StateChange) -> KernelResult<()> {
        self.apply(&change)?;
        self.journal.push(change);
        Ok(())
    }

    /// Drain the journal.
    pub fn take_journal(&mut self) -> Vec<StateChange> {
        core::mem::take(&mut self.journal)
    }

    /// Changes recorded since the last drain.
    pub fn journal(&self) -> &[StateChange] {
        &self.journal
    }

    /// Apply a change without journaling it.
    ///
    /// Used directly only by replay; live code goes through `record`.
    pub fn apply(&mut self, change: &StateChange) -> KernelResult<()> {
        match change {
            StateChange::ObjectCreated { kref, owner } => {
                self.objects.insert(
                    *kref,
                    KernelObject {
                        owner: Some(*owner),
                        counts: RefCounts::default(),
                    },
                );
                bump(&mut self.next_object_id, kref.id());
            }
            StateChange::ObjectCounts { kref, counts } => {
                self.object_mut(kref)?.counts = *counts;
            }
            StateChange::ObjectOwnerCleared { kref } => {
                self.object_mut(kref)?.owner = None;
            }
            StateChange::ObjectDeleted { kref } => {
                self.objects
                    .remove(kref)
                    .ok_or(KernelError::UnknownKref(*kref))?;
            }
            StateChange::DeviceNodeCreated { kref, owner } => {
                self.device_nodes.insert(*kref, *owner);
                bump(&mut self.next_devnode_id, kref.id());
            }
            StateChange::PromiseCreated { kpid, decider } => {
                self.promises.insert(*kpid, KernelPromise::new(*decider));
                bump(&mut self.next_promise_id, kpid.id());
            }
            StateChange::PromiseDecider { kpid, decider } => {
                self.promise_mut(kpid)?.decider = *decider;
            }
            StateChange::PromiseSubscribed { kpid, vat } => {
                self.promise_mut(kpid)?.subscribers.insert(*vat);
            }
            StateChange::PromiseEnqueued { kpid, msg } => {
                self.promise_mut(kpid)?.queue.push(msg.clone());
            }
            StateChange::PromiseQueueCleared { kpid } => {
                self.promise_mut(kpid)?.queue.clear();
            }
            StateChange::PromiseResolved {
                kpid,
                rejected,
                data,
            } => {
                let p = self.promise_mut(kpid)?;
                p.state = if *rejected {
                    PromiseState::Rejected
                } else {
                    PromiseState::Fulfilled
                };
                p.data = Some(data.clone());
                p.decider = None;
                p.subscribers.clear();
                p.queue.clear();
            }
            StateChange::PromiseRefCount { kpid, refcount } => {
                self.promise_mut(kpid)?.refcount = *refcount;
            }
            StateChange::PromiseDeleted { kpid } => {
                self.promises
                    .remove(kpid)
                    .ok_or(KernelError::UnknownKref(*kpid))?;
            }
            StateChange::CListAdded {
                participant,
                kref,
                vref,
                reachable,
            } => {
                self.clists
                    .entry(*participant)
                    .or_default()
                    .insert(*kref, *vref, *reachable);
            }
            StateChange::CListReachable {
                participant,
                kref,
                reachable,
            } => {
                self.clist_mut(participant)?.set_reachable(kref, *reachable);
            }
            StateChange::CListRemoved {
                participant, kref, ..
            } => {
                self.clist_mut(participant)?
                    .remove(kref)
                    .ok_or(KernelError::UnknownKref(*kref))?;
            }
            StateChange::RunQueuePushed { pos, item } => {
                let tail = self.run_queue_head + self.run_queue.len() as u64;
                if *pos != tail {
                    return Err(KernelError::corrupt(format!(
                        "run-queue push at {} but tail is {}",
                        pos, tail
                    )));
                }
                self.run_queue.push_back(item.clone());
            }
            StateChange::RunQueuePopped { pos } => {
                if *pos != self.run_queue_head || self.run_queue.pop_front().is_none() {
                    return Err(KernelError::corrupt(format!(
                        "run-queue pop at {} but head is {}",
                        pos, self.run_queue_head
                    )));
                }
                self.run_queue_head += 1;
            }
            StateChange::VatCreated { vat, record } => {
                self.vats.insert(*vat, record.clone());
                self.clists.entry(Participant::Vat(*vat)).or_default();
                bump(&mut self.next_vat_id, vat.0);
            }
            StateChange::VatStatusChanged { vat, status } => {
                self.vat_mut(vat)?.status = *status;
            }
            StateChange::VatIncarnation {
                vat,
                incarnation,
                bundle,
            } => {
                let record = self.vat_mut(vat)?;
                record.incarnation = *incarnation;
                record.bundle = bundle.clone();
            }
            StateChange::VatDirt { vat, deliveries } => {
                self.vat_mut(vat)?.deliveries_since_reap = *deliveries;
            }
            StateChange::DeviceCreated { device, record } => {
                self.devices.insert(*device, record.clone());
                self.clists.entry(Participant::Device(*device)).or_default();
                bump(&mut self.next_device_id, device.0);
            }
            StateChange::VatstoreSet { vat, key, value } => {
                self.vatstore
                    .entry(*vat)
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
            StateChange::VatstoreDeleted { vat, key } => {
                if let Some(store) = self.vatstore.get_mut(vat) {
                    store.remove(key);
                }
            }
            StateChange::VatstoreCleared { vat, .. } => {
                self.vatstore.remove(vat);
            }
            StateChange::ObjectPinned { kref } => {
                self.pinned.insert(*kref);
            }
            StateChange::KernelHold { kpid, held } => {
                if *held {
                    self.kernel_held.insert(*kpid);
                } else {
                    self.kernel_held.remove(kpid);
                }
            }
            StateChange::CrankFinished { crank } => {
                self.crank_number = crank + 1;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Read-only accessors
    // ========================================================================

    /// Get a kernel object
    pub fn object(&self, kref: &KRef) -> Option<&KernelObject> {
        self.objects.get(kref)
    }

    /// Get a kernel promise
    pub fn promise(&self, kpid: &KRef) -> Option<&KernelPromise> {
        self.promises.get(kpid)
    }

    /// Owner of a device node
    pub fn device_node_owner(&self, kref: &KRef) -> Option<DeviceId> {
        self.device_nodes.get(kref).copied()
    }

    /// Get a participant's c-list
    pub fn clist(&self, participant: &Participant) -> Option<&CList> {
        self.clists.get(participant)
    }

    /// Get a vat record (terminated vats included)
    pub fn vat(&self, vat: &VatId) -> Option<&VatRecord> {
        self.vats.get(vat)
    }

    /// All vats in ID order
    pub fn vats(&self) -> impl Iterator<Item = (&VatId, &VatRecord)> {
        self.vats.iter()
    }

    /// Get a device record
    pub fn device(&self, device: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(device)
    }

    /// Read one vatstore key
    pub fn vatstore_get(&self, vat: &VatId, key: &str) -> Option<&String> {
        self.vatstore.get(vat).and_then(|s| s.get(key))
    }

    /// Number of keys in a vat's vatstore
    pub fn vatstore_len(&self, vat: &VatId) -> usize {
        self.vatstore.get(vat).map(|s| s.len()).unwrap_or(0)
    }

    /// The run queue, head first
    pub fn run_queue(&self) -> &VecDeque<RunQueueItem> {
        &self.run_queue
    }

    /// Number of queued items
    pub fn run_queue_len(&self) -> usize {
        self.run_queue.len()
    }

    /// Position of the queue head (persisted key index)
    pub fn run_queue_head(&self) -> u64 {
        self.run_queue_head
    }

    /// Number of cranks committed so far
    pub fn crank_number(&self) -> CrankNum {
        self.crank_number
    }

    /// Whether the host pinned an object
    pub fn is_pinned(&self, kref: &KRef) -> bool {
        self.pinned.contains(kref)
    }

    /// Whether the host holds a promise
    pub fn is_kernel_held(&self, kpid: &KRef) -> bool {
        self.kernel_held.contains(kpid)
    }

    /// Number of live kernel objects
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Number of live kernel promises
    pub fn promise_count(&self) -> usize {
        self.promises.len()
    }

    /// Krefs waiting for end-of-crank refcount processing
    pub fn maybe_free(&self) -> &BTreeSet<KRef> {
        &self.maybe_free
    }

    // ========================================================================
    // Internal mutable lookups (apply only)
    // ========================================================================

    fn object_mut(&mut self, kref: &KRef) -> KernelResult<&mut KernelObject> {
        self.objects
            .get_mut(kref)
            .ok_or(KernelError::UnknownKref(*kref))
    }

    fn promise_mut(&mut self, kpid: &KRef) -> KernelResult<&mut KernelPromise> {
        self.promises
            .get_mut(kpid)
            .ok_or(KernelError::UnknownKref(*kpid))
    }

    fn clist_mut(&mut self, participant: &Participant) -> KernelResult<&mut CList> {
        self.clists
            .get_mut(participant)
            .ok_or_else(|| KernelError::corrupt(format!("no c-list for {}", participant)))
    }

    fn vat_mut(&mut self, vat: &VatId) -> KernelResult<&mut VatRecord> {
        self.vats
            .get_mut(vat)
            .ok_or_else(|| KernelError::UnknownVat(format!("{}", vat)))
    }

    // ========================================================================
    // Hashing
    // ========================================================================

    /// Deterministic hash of every persistent table.
    ///
    /// Transient per-crank sets and the journal are excluded.
    pub fn compute_hash(&self) -> CommitId {
        let mut h = StateHasher::new();
        h.write_json(&self.objects);
        h.write_json(&self.promises);
        h.write_json(&self.device_nodes);
        h.write_json(&self.clists);
        h.write_json(&self.vats);
        h.write_json(&self.devices);
        h.write_json(&self.vatstore);
        h.write_json(&self.pinned);
        h.write_json(&self.kernel_held);
        h.write_json(&self.run_queue);
        h.write_u64(self.run_queue_head);
        h.write_u64(self.next_vat_id);
        h.write_u64(self.next_device_id);
        h.write_u64(self.next_object_id);
        h.write_u64(self.next_devnode_id);
        h.write_u64(self.next_promise_id);
        h.write_u64(self.crank_number);
        h.finalize()
    }

    /// Whether a vat exists and has not been terminated.
    pub fn is_vat_alive(&self, vat: &VatId) -> bool {
        self.vats
            .get(vat)
            .map(|r| r.status != VatStatus::Terminated)
            .unwrap_or(false)
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(next: &mut u64, allocated: u64) {
    if allocated >= *next {
        *next = allocated + 1;
    }
}

impl Replayable for KernelState {
    type Change = StateChange;

    fn replay_genesis(&mut self) -> ReplayResult<()> {
        Ok(())
    }

    fn replay_change(&mut self, change: &StateChange) -> ReplayResult<()> {
        self.apply(change)
            .map_err(|e| ReplayError::InvalidCommit(format!("{}", e)))
    }

    fn replay_crank_boundary(&mut self, _crank: CrankNum) -> ReplayResult<()> {
        // Transient sets never survive a crank
        self.maybe_free.clear();
        self.pending_gc.clear();
        Ok(())
    }

    fn state_hash(&self) -> CommitId {
        self.compute_hash()
    }
}
