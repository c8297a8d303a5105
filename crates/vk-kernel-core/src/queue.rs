//! Run queue items and the kernel-side message operations that feed it.
//!
//! ```text
//!   syscall.send ─▶ do_send ─────────────┐
//!   syscall.subscribe ─▶ do_subscribe ──┐│
//!   syscall.resolve ─▶ do_resolve ─▶ notify ─▶ run queue (FIFO)
//!   host.queue_to_kref ─▶ do_send ───────┘
//! ```
//!
//! Every item on the queue holds references to the krefs it names, except
//! GC items, which are re-filtered when delivered instead.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::state::{KernelState, StateChange};
use crate::table::RefOptions;
use crate::types::{CapData, KRef, Message, RefType, Resolution, VatId};

/// The three GC deliveries, in delivery priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GcKind {
    DropExports,
    RetireExports,
    RetireImports,
}

impl GcKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GcKind::DropExports => "dropExports",
            GcKind::RetireExports => "retireExports",
            GcKind::RetireImports => "retireImports",
        }
    }
}

/// One pending GC action. Field order gives the grouping order: by vat,
/// then kind, then kref.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct GcAction {
    pub vat: VatId,
    pub kind: GcKind,
    pub kref: KRef,
}

/// A run-queue entry. Persisted as JSON under `runQueue.<pos>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunQueueItem {
    Send {
        target: KRef,
        msg: Message,
    },
    Notify {
        vat: VatId,
        kpid: KRef,
    },
    Gc {
        vat: VatId,
        kind: GcKind,
        krefs: Vec<KRef>,
    },
    #[serde(rename_all = "camelCase")]
    StartVat {
        vat: VatId,
        vat_parameters: CapData,
    },
    #[serde(rename_all = "camelCase")]
    UpgradeVat {
        vat: VatId,
        bundle: String,
        vat_parameters: CapData,
        upgrade_message: String,
    },
    TerminateVat {
        vat: VatId,
        reject: bool,
        info: CapData,
    },
    BringOutYourDead {
        vat: VatId,
    },
}

impl RunQueueItem {
    /// Short name for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            RunQueueItem::Send { .. } => "send",
            RunQueueItem::Notify { .. } => "notify",
            RunQueueItem::Gc { kind, .. } => kind.as_str(),
            RunQueueItem::StartVat { .. } => "startVat",
            RunQueueItem::UpgradeVat { .. } => "upgradeVat",
            RunQueueItem::TerminateVat { .. } => "terminateVat",
            RunQueueItem::BringOutYourDead { .. } => "bringOutYourDead",
        }
    }

    /// The vat the item is addressed to. `send` is routed at delivery time.
    pub fn vat(&self) -> Option<VatId> {
        match self {
            RunQueueItem::Send { .. } => None,
            RunQueueItem::Notify { vat, .. }
            | RunQueueItem::Gc { vat, .. }
            | RunQueueItem::StartVat { vat, .. }
            | RunQueueItem::UpgradeVat { vat, .. }
            | RunQueueItem::TerminateVat { vat, .. }
            | RunQueueItem::BringOutYourDead { vat } => Some(*vat),
        }
    }
}

impl KernelState {
    // ========================================================================
    // Queue primitives
    // ========================================================================

    /// Append an item at the tail.
    pub fn push_run_queue(&mut self, item: RunQueueItem) -> KernelResult<()> {
        let pos = self.run_queue_head + self.run_queue.len() as u64;
        self.record(StateChange::RunQueuePushed { pos, item })
    }

    /// Remove and return the head item.
    pub fn pop_run_queue(&mut self) -> KernelResult<Option<RunQueueItem>> {
        let Some(item) = self.run_queue.front().cloned() else {
            return Ok(None);
        };
        self.record(StateChange::RunQueuePopped {
            pos: self.run_queue_head,
        })?;
        Ok(Some(item))
    }

    // ========================================================================
    // Message operations
    // ========================================================================

    /// Queue a message, taking references on everything it names.
    pub fn do_send(&mut self, target: KRef, msg: Message) -> KernelResult<()> {
        if target.is_device() {
            return Err(KernelError::WrongType {
                expected: "object or promise",
                found: alloc::format!("{}", target),
            });
        }
        self.incref(target, RefOptions::NORMAL)?;
        if let Some(result) = msg.result {
            self.incref(result, RefOptions::NORMAL)?;
        }
        self.incref_slots(&msg.methargs.slots)?;
        self.push_run_queue(RunQueueItem::Send { target, msg })
    }

    /// Subscribe `vat` to `kpid`, or notify at once if already settled.
    pub fn do_subscribe(&mut self, vat: VatId, kpid: KRef) -> KernelResult<()> {
        if self.kernel_promise(&kpid)?.is_unresolved() {
            self.add_subscriber(kpid, vat)
        } else {
            self.notify(vat, kpid)
        }
    }

    /// Queue a notification of `kpid` to `vat`.
    pub fn notify(&mut self, vat: VatId, kpid: KRef) -> KernelResult<()> {
        self.incref(kpid, RefOptions::NORMAL)?;
        self.push_run_queue(RunQueueItem::Notify { vat, kpid })
    }

    /// Check that `kpid` may be settled by `resolver` (`None`: the kernel).
    pub fn check_resolvable(&self, kpid: KRef, resolver: Option<VatId>) -> KernelResult<()> {
        kpid.expect_type(RefType::Promise)?;
        let p = self.kernel_promise(&kpid)?;
        if !p.is_unresolved() {
            return Err(KernelError::AlreadyResolved(kpid));
        }
        if p.decider != resolver {
            return Err(KernelError::NotDecider {
                kpid,
                expected: resolver,
                actual: p.decider,
            });
        }
        Ok(())
    }

    /// Settle a batch of promises.
    ///
    /// Subscribers other than the resolver are notified. Each promise must
    /// still be unresolved and decided by `resolver`.
    pub fn do_resolve(
        &mut self,
        resolver: Option<VatId>,
        resolutions: Vec<Resolution>,
    ) -> KernelResult<()> {
        for resolution in resolutions {
            let kpid = resolution.promise;
            self.check_resolvable(kpid, resolver)?;
            let subscribers: Vec<VatId> = self
                .kernel_promise(&kpid)?
                .subscribers
                .iter()
                .copied()
                .collect();
            for subscriber in subscribers {
                if Some(subscriber) != resolver {
                    self.notify(subscriber, kpid)?;
                }
            }
            self.resolve_kernel_promise(kpid, resolution.rejected, resolution.data)?;
        }
        Ok(())
    }

    /// Reject one promise with a kernel-generated error.
    pub fn resolve_to_error(
        &mut self,
        kpid: KRef,
        error: CapData,
        expected_decider: Option<VatId>,
    ) -> KernelResult<()> {
        self.do_resolve(
            expected_decider,
            vec![Resolution {
                promise: kpid,
                rejected: true,
                data: error,
            }],
        )
    }

    /// Host entry point: send a message into the kernel.
    ///
    /// With `want_result`, a fresh kernel-decided result promise is created
    /// and held for the host until `release_kpid`.
    pub fn queue_to_kref(
        &mut self,
        target: KRef,
        methargs: CapData,
        want_result: bool,
    ) -> KernelResult<Option<KRef>> {
        if !self.kref_exists(&target) {
            return Err(KernelError::UnknownKref(target));
        }
        for slot in &methargs.slots {
            if !self.kref_exists(slot) {
                return Err(KernelError::UnknownKref(*slot));
            }
        }
        let result = if want_result {
            let kpid = self.add_kernel_promise(None)?;
            self.hold_kpid(kpid)?;
            Some(kpid)
        } else {
            None
        };
        self.do_send(target, Message::new(methargs, result))?;
        Ok(result)
    }
}
