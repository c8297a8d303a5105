//! Kernel object/promise table operations.
//!
//! Reference counting follows two rules:
//!
//! ```text
//!   object  : (reachable, recognizable), importer rows + promise data +
//!             queued messages + pins. The owner's own export row never counts.
//!   promise : single refcount, every c-list row (import or export), queued
//!             item, promise data and external hold.
//! ```
//!
//! Any count that may have reached zero goes into `maybe_free`; the end of
//! the crank (`gc::process_refcounts`) decides what actually happens.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::object::{KernelObject, KernelPromise};
use crate::queue::{GcAction, GcKind, RunQueueItem};
use crate::state::{KernelState, StateChange};
use crate::types::{CapData, DeviceId, KRef, Message, Participant, RefType, VatId};

/// How a reference count change should be applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefOptions {
    /// The reference is the owner's own export row (objects: not counted)
    pub is_export: bool,
    /// Only the recognizable count moves (objects only)
    pub only_recognizable: bool,
}

impl RefOptions {
    /// Count both tiers.
    pub const NORMAL: RefOptions = RefOptions {
        is_export: false,
        only_recognizable: false,
    };
    /// The owner's export row.
    pub const EXPORT: RefOptions = RefOptions {
        is_export: true,
        only_recognizable: false,
    };
    /// Recognizable tier only.
    pub const RECOGNIZABLE: RefOptions = RefOptions {
        is_export: false,
        only_recognizable: true,
    };
}

impl KernelState {
    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a new kernel object owned by `owner`.
    pub fn add_kernel_object(&mut self, owner: VatId) -> KernelResult<KRef> {
        let kref = KRef::Object(self.next_object_id);
        self.record(StateChange::ObjectCreated { kref, owner })?;
        Ok(kref)
    }

    /// Allocate a new unresolved kernel promise.
    pub fn add_kernel_promise(&mut self, decider: Option<VatId>) -> KernelResult<KRef> {
        let kpid = KRef::Promise(self.next_promise_id);
        self.record(StateChange::PromiseCreated { kpid, decider })?;
        Ok(kpid)
    }

    /// Allocate a new device node owned by `owner`.
    pub fn add_device_node(&mut self, owner: DeviceId) -> KernelResult<KRef> {
        let kref = KRef::Device(self.next_devnode_id);
        self.record(StateChange::DeviceNodeCreated { kref, owner })?;
        Ok(kref)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Get an object row or fail.
    pub fn kernel_object(&self, kref: &KRef) -> KernelResult<&KernelObject> {
        kref.expect_type(RefType::Object)?;
        self.objects
            .get(kref)
            .ok_or(KernelError::UnknownKref(*kref))
    }

    /// Get a promise row or fail.
    pub fn kernel_promise(&self, kpid: &KRef) -> KernelResult<&KernelPromise> {
        kpid.expect_type(RefType::Promise)?;
        self.promises
            .get(kpid)
            .ok_or(KernelError::UnknownKref(*kpid))
    }

    /// Whether a kref names a live table row.
    pub fn kref_exists(&self, kref: &KRef) -> bool {
        match kref {
            KRef::Object(_) => self.objects.contains_key(kref),
            KRef::Promise(_) => self.promises.contains_key(kref),
            KRef::Device(_) => self.device_nodes.contains_key(kref),
        }
    }

    /// The vat that can receive messages for `kref`.
    ///
    /// `None` when the object was abandoned, collected, or its owner was
    /// terminated.
    pub fn owner_of(&self, kref: &KRef) -> Option<VatId> {
        let owner = self.objects.get(kref)?.owner?;
        if self.is_vat_alive(&owner) {
            Some(owner)
        } else {
            None
        }
    }

    // ========================================================================
    // Reference counts
    // ========================================================================

    /// Add one reference.
    pub fn incref(&mut self, kref: KRef, opts: RefOptions) -> KernelResult<()> {
        match kref {
            KRef::Promise(_) => {
                let refcount = self.kernel_promise(&kref)?.refcount + 1;
                self.record(StateChange::PromiseRefCount {
                    kpid: kref,
                    refcount,
                })
            }
            KRef::Object(_) => {
                if opts.is_export {
                    return Ok(());
                }
                let mut counts = self.kernel_object(&kref)?.counts;
                counts.recognizable += 1;
                if !opts.only_recognizable {
                    counts.reachable += 1;
                }
                self.record(StateChange::ObjectCounts { kref, counts })
            }
            // Device nodes live as long as their device
            KRef::Device(_) => Ok(()),
        }
    }

    /// Drop one reference.
    ///
    /// Decrementing an object that was already deleted is a no-op: importer
    /// rows outlive the object until their `retireImports` is delivered.
    pub fn decref(&mut self, kref: KRef, opts: RefOptions) -> KernelResult<()> {
        match kref {
            KRef::Promise(_) => {
                let refcount = self
                    .kernel_promise(&kref)?
                    .refcount
                    .checked_sub(1)
                    .ok_or(KernelError::RefCountUnderflow(kref))?;
                self.record(StateChange::PromiseRefCount {
                    kpid: kref,
                    refcount,
                })?;
                if refcount == 0 {
                    self.maybe_free.insert(kref);
                }
                Ok(())
            }
            KRef::Object(_) => {
                if opts.is_export {
                    return Ok(());
                }
                let Some(obj) = self.objects.get(&kref) else {
                    return Ok(());
                };
                let mut counts = obj.counts;
                if !opts.only_recognizable {
                    counts.reachable = counts
                        .reachable
                        .checked_sub(1)
                        .ok_or(KernelError::RefCountUnderflow(kref))?;
                }
                counts.recognizable = counts
                    .recognizable
                    .checked_sub(1)
                    .ok_or(KernelError::RefCountUnderflow(kref))?;
                if counts.reachable > counts.recognizable {
                    return Err(KernelError::RefCountUnderflow(kref));
                }
                self.record(StateChange::ObjectCounts { kref, counts })?;
                if counts.reachable == 0 || counts.recognizable == 0 {
                    self.maybe_free.insert(kref);
                }
                Ok(())
            }
            KRef::Device(_) => Ok(()),
        }
    }

    /// Move an object's reachable count alone (a c-list flag flipped).
    pub(crate) fn adjust_reachable(&mut self, kref: KRef, up: bool) -> KernelResult<()> {
        let Some(obj) = self.objects.get(&kref) else {
            return Ok(());
        };
        let mut counts = obj.counts;
        if up {
            counts.reachable += 1;
            if counts.reachable > counts.recognizable {
                return Err(KernelError::corrupt(alloc::format!(
                    "{} reachable above recognizable",
                    kref
                )));
            }
        } else {
            counts.reachable = counts
                .reachable
                .checked_sub(1)
                .ok_or(KernelError::RefCountUnderflow(kref))?;
        }
        self.record(StateChange::ObjectCounts { kref, counts })?;
        if counts.reachable == 0 {
            self.maybe_free.insert(kref);
        }
        Ok(())
    }

    /// Add one normal reference to each slot.
    pub fn incref_slots(&mut self, slots: &[KRef]) -> KernelResult<()> {
        for slot in slots {
            self.incref(*slot, RefOptions::NORMAL)?;
        }
        Ok(())
    }

    /// Drop one normal reference from each slot.
    pub fn decref_slots(&mut self, slots: &[KRef]) -> KernelResult<()> {
        for slot in slots {
            self.decref(*slot, RefOptions::NORMAL)?;
        }
        Ok(())
    }

    /// Release the references a run-queue `send` item holds.
    pub fn decref_message(&mut self, target: KRef, msg: &Message) -> KernelResult<()> {
        self.decref(target, RefOptions::NORMAL)?;
        if let Some(result) = msg.result {
            self.decref(result, RefOptions::NORMAL)?;
        }
        self.decref_slots(&msg.methargs.slots)
    }

    // ========================================================================
    // Pins and external holds
    // ========================================================================

    /// Pin an object so it is never collected. Idempotent.
    pub fn pin_object(&mut self, kref: KRef) -> KernelResult<()> {
        self.kernel_object(&kref)?;
        if self.pinned.contains(&kref) {
            return Ok(());
        }
        self.incref(kref, RefOptions::NORMAL)?;
        self.record(StateChange::ObjectPinned { kref })
    }

    /// Take an external hold on a promise (host-visible result).
    pub fn hold_kpid(&mut self, kpid: KRef) -> KernelResult<()> {
        self.kernel_promise(&kpid)?;
        if self.kernel_held.contains(&kpid) {
            return Ok(());
        }
        self.incref(kpid, RefOptions::NORMAL)?;
        self.record(StateChange::KernelHold { kpid, held: true })
    }

    /// Release an external hold. Returns `false` if none was held.
    pub fn release_kpid(&mut self, kpid: KRef) -> KernelResult<bool> {
        if !self.kernel_held.contains(&kpid) {
            return Ok(false);
        }
        self.record(StateChange::KernelHold { kpid, held: false })?;
        self.decref(kpid, RefOptions::NORMAL)?;
        Ok(true)
    }

    // ========================================================================
    // Object lifecycle
    // ========================================================================

    /// Participants holding `kref` as an import, in participant order.
    pub fn importers_of(&self, kref: &KRef) -> Vec<Participant> {
        self.clists
            .iter()
            .filter(|(_, clist)| {
                clist
                    .get(kref)
                    .map(|entry| !entry.vref.allocated_by_vat)
                    .unwrap_or(false)
            })
            .map(|(p, _)| *p)
            .collect()
    }

    /// Disown an object on behalf of its exporter.
    ///
    /// The owner's row goes away without touching the counts (export rows
    /// never counted). The object stays alive for its importers.
    pub fn orphan_kernel_object(&mut self, kref: KRef, vat: VatId) -> KernelResult<()> {
        let owner = self.kernel_object(&kref)?.owner;
        if owner != Some(vat) {
            return Err(KernelError::illegal(alloc::format!(
                "{} is not owned by {}",
                kref, vat
            )));
        }
        self.record(StateChange::ObjectOwnerCleared { kref })?;
        let participant = Participant::Vat(vat);
        if let Some(entry) = self.clists.get(&participant).and_then(|c| c.get(&kref)) {
            let vref = entry.vref;
            self.record(StateChange::CListRemoved {
                participant,
                kref,
                vref,
            })?;
        }
        self.maybe_free.insert(kref);
        Ok(())
    }

    /// Remove an object row.
    pub fn delete_kernel_object(&mut self, kref: KRef) -> KernelResult<()> {
        self.kernel_object(&kref)?;
        self.record(StateChange::ObjectDeleted { kref })
    }

    /// Tell every importer to forget the objects, then delete them.
    ///
    /// Vat importers get a `retireImports` action; their rows are removed
    /// when it is delivered. Devices never drop their imports, so an object
    /// reaching this point has no device importers.
    pub fn retire_kernel_objects(&mut self, krefs: &[KRef]) -> KernelResult<()> {
        for kref in krefs {
            for importer in self.importers_of(kref) {
                if let Participant::Vat(vat) = importer {
                    self.pending_gc.insert(GcAction {
                        vat,
                        kind: GcKind::RetireImports,
                        kref: *kref,
                    });
                }
            }
            self.delete_kernel_object(*kref)?;
        }
        Ok(())
    }

    // ========================================================================
    // Promise lifecycle
    // ========================================================================

    /// Change a promise's decider.
    pub fn set_decider(&mut self, kpid: KRef, decider: Option<VatId>) -> KernelResult<()> {
        self.kernel_promise(&kpid)?;
        self.record(StateChange::PromiseDecider { kpid, decider })
    }

    /// Subscribe a vat to a promise. Idempotent.
    pub fn add_subscriber(&mut self, kpid: KRef, vat: VatId) -> KernelResult<()> {
        if self.kernel_promise(&kpid)?.subscribers.contains(&vat) {
            return Ok(());
        }
        self.record(StateChange::PromiseSubscribed { kpid, vat })
    }

    /// Park a message on an unresolved promise. It keeps its references.
    pub fn add_message_to_promise_queue(&mut self, kpid: KRef, msg: Message) -> KernelResult<()> {
        if !self.kernel_promise(&kpid)?.is_unresolved() {
            return Err(KernelError::AlreadyResolved(kpid));
        }
        self.record(StateChange::PromiseEnqueued { kpid, msg })
    }

    /// Move every message queued on `kpid` back to the run queue, targeted
    /// at the promise. References move with them unchanged.
    pub fn requeue_kernel_promise(&mut self, kpid: KRef) -> KernelResult<()> {
        let queue = self.kernel_promise(&kpid)?.queue.clone();
        if queue.is_empty() {
            return Ok(());
        }
        for msg in queue {
            self.push_run_queue(RunQueueItem::Send { target: kpid, msg })?;
        }
        self.record(StateChange::PromiseQueueCleared { kpid })
    }

    /// Settle a promise: hold its data slots, release its queue, record the
    /// outcome. Callers check decider and state first.
    pub fn resolve_kernel_promise(
        &mut self,
        kpid: KRef,
        rejected: bool,
        data: CapData,
    ) -> KernelResult<()> {
        self.incref_slots(&data.slots)?;
        self.requeue_kernel_promise(kpid)?;
        self.record(StateChange::PromiseResolved {
            kpid,
            rejected,
            data,
        })
    }

    /// Unresolved promises decided by `vat`, in kpid order.
    pub fn enumerate_promises_by_decider(&self, vat: VatId) -> Vec<KRef> {
        self.promises
            .iter()
            .filter(|(_, p)| p.is_unresolved() && p.decider == Some(vat))
            .map(|(k, _)| *k)
            .collect()
    }

    /// The settled promises a notification of `root` must carry: `root`
    /// first, then every settled promise reachable through settled data,
    /// depth first.
    pub fn get_kpids_to_retire(&self, root: KRef) -> Vec<KRef> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut stack = alloc::vec![root];
        while let Some(kpid) = stack.pop() {
            if !seen.insert(kpid) {
                continue;
            }
            let Some(p) = self.promises.get(&kpid) else {
                continue;
            };
            if !p.state.is_settled() {
                continue;
            }
            order.push(kpid);
            if let Some(data) = &p.data {
                for slot in data.slots.iter().rev() {
                    if slot.is_promise() && !seen.contains(slot) {
                        stack.push(*slot);
                    }
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{VatOptions, VatRecord};
    use crate::object::PromiseState;
    use crate::types::RefCounts;
    use alloc::vec;

    fn state_with_vats(n: u64) -> KernelState {
        let mut state = KernelState::new();
        for i in 1..=n {
            state
                .record(StateChange::VatCreated {
                    vat: VatId(i),
                    record: VatRecord::new("v", "b", VatOptions::default()),
                })
                .unwrap();
        }
        state
    }

    #[test]
    fn test_object_incref_decref() {
        let mut state = state_with_vats(1);
        let ko = state.add_kernel_object(VatId(1)).unwrap();
        assert_eq!(ko, KRef::Object(20));

        state.incref(ko, RefOptions::NORMAL).unwrap();
        state.incref(ko, RefOptions::RECOGNIZABLE).unwrap();
        assert_eq!(state.kernel_object(&ko).unwrap().counts, RefCounts::new(1, 2));

        // Export rows never count
        state.incref(ko, RefOptions::EXPORT).unwrap();
        assert_eq!(state.kernel_object(&ko).unwrap().counts, RefCounts::new(1, 2));

        state.decref(ko, RefOptions::NORMAL).unwrap();
        assert_eq!(state.kernel_object(&ko).unwrap().counts, RefCounts::new(0, 1));
        assert!(state.maybe_free().contains(&ko));
    }

    #[test]
    fn test_decref_underflow_is_error() {
        let mut state = state_with_vats(1);
        let ko = state.add_kernel_object(VatId(1)).unwrap();
        assert_eq!(
            state.decref(ko, RefOptions::NORMAL),
            Err(KernelError::RefCountUnderflow(ko))
        );

        let kp = state.add_kernel_promise(None).unwrap();
        assert_eq!(
            state.decref(kp, RefOptions::NORMAL),
            Err(KernelError::RefCountUnderflow(kp))
        );
    }

    #[test]
    fn test_decref_deleted_object_is_noop() {
        let mut state = state_with_vats(1);
        let ko = state.add_kernel_object(VatId(1)).unwrap();
        state.delete_kernel_object(ko).unwrap();
        assert!(state.decref(ko, RefOptions::NORMAL).is_ok());
    }

    #[test]
    fn test_owner_of_terminated_vat_is_none() {
        let mut state = state_with_vats(1);
        let ko = state.add_kernel_object(VatId(1)).unwrap();
        assert_eq!(state.owner_of(&ko), Some(VatId(1)));

        state
            .record(StateChange::VatStatusChanged {
                vat: VatId(1),
                status: crate::lifecycle::VatStatus::Terminated,
            })
            .unwrap();
        assert_eq!(state.owner_of(&ko), None);
    }

    #[test]
    fn test_resolve_requeues_messages() {
        let mut state = state_with_vats(1);
        let kp = state.add_kernel_promise(Some(VatId(1))).unwrap();
        let msg = Message::new(CapData::bare("#[]"), None);
        state.add_message_to_promise_queue(kp, msg.clone()).unwrap();
        state.add_subscriber(kp, VatId(1)).unwrap();

        state
            .resolve_kernel_promise(kp, false, CapData::bare("#1"))
            .unwrap();

        let p = state.kernel_promise(&kp).unwrap();
        assert_eq!(p.state, PromiseState::Fulfilled);
        assert!(p.queue.is_empty() && p.subscribers.is_empty() && p.decider.is_none());
        assert_eq!(
            state.run_queue().front(),
            Some(&RunQueueItem::Send { target: kp, msg })
        );
        // Settling twice is rejected by the table
        assert!(state
            .add_message_to_promise_queue(kp, Message::new(CapData::bare("#[]"), None))
            .is_err());
    }

    #[test]
    fn test_kpids_to_retire_follows_settled_data() {
        let mut state = state_with_vats(1);
        let a = state.add_kernel_promise(None).unwrap();
        let b = state.add_kernel_promise(None).unwrap();
        let c = state.add_kernel_promise(None).unwrap();
        state
            .resolve_kernel_promise(b, false, CapData::new("#[]", vec![a]))
            .unwrap();
        state
            .resolve_kernel_promise(a, false, CapData::new("#[]", vec![b, c]))
            .unwrap();

        // c is unresolved, so it is not carried
        assert_eq!(state.get_kpids_to_retire(a), vec![a, b]);
    }

    #[test]
    fn test_orphan_checks_owner() {
        let mut state = state_with_vats(2);
        let ko = state.add_kernel_object(VatId(1)).unwrap();
        assert!(state.orphan_kernel_object(ko, VatId(2)).is_err());
        state.orphan_kernel_object(ko, VatId(1)).unwrap();
        assert_eq!(state.kernel_object(&ko).unwrap().owner, None);
        assert!(state.maybe_free().contains(&ko));
    }

    #[test]
    fn test_pin_is_idempotent() {
        let mut state = state_with_vats(1);
        let ko = state.add_kernel_object(VatId(1)).unwrap();
        state.pin_object(ko).unwrap();
        state.pin_object(ko).unwrap();
        assert_eq!(state.kernel_object(&ko).unwrap().counts, RefCounts::new(1, 1));
        assert!(state.is_pinned(&ko));
    }
}
