//! End-of-crank garbage collection.
//!
//! ```text
//!   maybe_free ──process_refcounts──▶ deleted promises / objects
//!                      │
//!                      └──▶ pending_gc ──flush_gc_actions──▶ run queue
//!                                         (grouped per vat and kind)
//! ```
//!
//! Decisions for an object whose reachable count reached zero:
//!
//! | owner            | row flag | recognizable | action                      |
//! |------------------|----------|--------------|-----------------------------|
//! | live             | set      | any          | `dropExports` to owner      |
//! | live             | any      | 0            | `retireExports` to owner    |
//! | none/terminated  | -        | > 0          | `retireImports` to importers, delete |
//! | none/terminated  | -        | 0            | delete                      |

use alloc::vec::Vec;

use crate::error::KernelResult;
use crate::queue::{GcAction, GcKind, RunQueueItem};
use crate::state::{KernelState, StateChange};
use crate::types::{KRef, Participant, VatId};

impl KernelState {
    /// Turn this crank's refcount transitions into deletions and GC actions.
    ///
    /// Runs to a fixed point: deleting a promise releases its data slots,
    /// which can free more krefs. Always processes the smallest kref first.
    pub fn process_refcounts(&mut self) -> KernelResult<()> {
        while let Some(kref) = self.maybe_free.pop_first() {
            match kref {
                KRef::Promise(_) => self.collect_promise(kref)?,
                KRef::Object(_) => self.collect_object(kref)?,
                KRef::Device(_) => {}
            }
        }
        Ok(())
    }

    fn collect_promise(&mut self, kpid: KRef) -> KernelResult<()> {
        let Some(p) = self.promises.get(&kpid) else {
            return Ok(());
        };
        if p.refcount != 0 {
            return Ok(());
        }
        let slots = p.data.as_ref().map(|d| d.slots.clone()).unwrap_or_default();
        self.decref_slots(&slots)?;
        self.record(StateChange::PromiseDeleted { kpid })
    }

    fn collect_object(&mut self, kref: KRef) -> KernelResult<()> {
        let Some(obj) = self.objects.get(&kref) else {
            return Ok(());
        };
        if obj.counts.reachable != 0 {
            return Ok(());
        }
        let recognizable = obj.counts.recognizable;
        let mut owner = obj.owner;

        if let Some(vat) = owner {
            let participant = Participant::Vat(vat);
            if self.is_vat_alive(&vat) {
                let flagged = self
                    .clist_entry(&participant, &kref)
                    .map(|e| e.reachable)
                    .unwrap_or(false);
                if flagged {
                    self.pending_gc.insert(GcAction {
                        vat,
                        kind: GcKind::DropExports,
                        kref,
                    });
                }
                if recognizable == 0 {
                    self.pending_gc.insert(GcAction {
                        vat,
                        kind: GcKind::RetireExports,
                        kref,
                    });
                }
            } else {
                // Never deliver into a dead vat: abandon on its behalf
                if let Some(entry) = self.clist_entry(&participant, &kref) {
                    self.record(StateChange::CListRemoved {
                        participant,
                        kref,
                        vref: entry.vref,
                    })?;
                }
                self.record(StateChange::ObjectOwnerCleared { kref })?;
                owner = None;
            }
        }

        if owner.is_none() {
            if recognizable > 0 {
                self.retire_kernel_objects(&[kref])?;
            } else {
                self.delete_kernel_object(kref)?;
            }
        }
        Ok(())
    }

    /// Append pending GC actions to the run queue, one item per vat and
    /// kind, vats ascending, `dropExports` before `retireExports` before
    /// `retireImports`.
    pub fn flush_gc_actions(&mut self) -> KernelResult<()> {
        let actions = core::mem::take(&mut self.pending_gc);
        let mut current: Option<(VatId, GcKind, Vec<KRef>)> = None;
        for action in actions {
            if !self.is_vat_alive(&action.vat) {
                continue;
            }
            match &mut current {
                Some((vat, kind, krefs)) if *vat == action.vat && *kind == action.kind => {
                    krefs.push(action.kref);
                }
                _ => {
                    if let Some((vat, kind, krefs)) = current.take() {
                        self.push_run_queue(RunQueueItem::Gc { vat, kind, krefs })?;
                    }
                    current = Some((action.vat, action.kind, alloc::vec![action.kref]));
                }
            }
        }
        if let Some((vat, kind, krefs)) = current {
            self.push_run_queue(RunQueueItem::Gc { vat, kind, krefs })?;
        }
        Ok(())
    }

    /// Keep only the krefs a queued GC action still applies to.
    ///
    /// Between queueing and delivery an object may regain a reference, or
    /// an earlier action may already have done the work.
    pub fn filter_gc_action(&self, vat: VatId, kind: GcKind, krefs: &[KRef]) -> Vec<KRef> {
        let participant = Participant::Vat(vat);
        krefs
            .iter()
            .copied()
            .filter(|kref| {
                let entry = self.clist_entry(&participant, kref);
                let obj = self.objects.get(kref);
                match kind {
                    GcKind::DropExports => match (obj, entry) {
                        (Some(o), Some(e)) => {
                            o.owner == Some(vat) && o.counts.reachable == 0 && e.reachable
                        }
                        _ => false,
                    },
                    GcKind::RetireExports => match (obj, entry) {
                        (Some(o), Some(_)) => o.owner == Some(vat) && o.counts.is_zero(),
                        _ => false,
                    },
                    GcKind::RetireImports => {
                        entry.map(|e| !e.vref.allocated_by_vat).unwrap_or(false) && obj.is_none()
                    }
                }
            })
            .collect()
    }
}
