//! The crank loop.
//!
//! One crank handles exactly one run-queue item:
//!
//! ```text
//!  savepoint ─▶ pop ─▶ plan ─┬─ None ──────────────────────────────┐
//!                            ├─ Deliver ─▶ sandbox ─┬─ ok ─────────┤
//!                            │                      └─ fatal ─▶ rollback,
//!                            │                           terminate ┤
//!                            ├─ Terminate ─────────────────────────┤
//!                            └─ Upgrade ─▶ BOYD, startVat ─┬─ ok ──┤
//!                                                  └─ fail ─▶ rollback,
//!                                                        consume ──┤
//!                                                                  ▼
//!                             process refcounts, flush GC actions, commit
//! ```
//!
//! Rolling back restores the tables to the savepoint, so a failed delivery
//! leaves no partial refcount changes. `exit` with `failure` set counts as a
//! failed delivery; a clean `exit` keeps what the delivery did. The item
//! stays on the queue unless the plan says to consume it; a retried message
//! then splats against the terminated vat.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use vk_axiom::CrankNum;
use vk_kernel_core::{
    check_all_invariants, kernel_error, CapData, DeliveryPlan, KernelError, KernelState, Plan,
    RunQueueItem, StateChange, VatDelivery, VatId,
};
use vk_store::{KvStore, TranscriptStore};

use crate::error::{CrankResult, KernelPanic};
use crate::kernel::{Kernel, TerminationNotice, TranscriptOp};
use crate::policy::{Forever, RunPolicy};
use crate::sandbox::{DeliveryStatus, VatSandbox};
use crate::syscall::{log_detail, SyscallContext, SyscallSummary};
use crate::transcript::TranscriptEntry;

/// What one crank did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrankOutcome {
    /// A delivery completed
    Delivered { vat: VatId, delivery: &'static str },
    /// Kernel-side work only (splat, requeue, skipped item)
    KernelOnly,
    VatTerminated { vat: VatId },
    Upgraded { vat: VatId, incarnation: u64 },
    /// The vat keeps its previous incarnation
    UpgradeFailed { vat: VatId, reason: String },
}

/// One delivery's result as seen by the crank.
struct DeliveryRun {
    status: DeliveryStatus,
    summary: SyscallSummary,
}

impl DeliveryRun {
    fn failure(&self) -> Option<String> {
        if let Some(reason) = &self.summary.fatal {
            return Some(reason.clone());
        }
        match &self.status {
            DeliveryStatus::Ok => None,
            DeliveryStatus::Error(reason) => Some(reason.clone()),
        }
    }

    /// Why the crank must be undone, with the info for the termination
    /// notice. A vat that exits with `failure` aborts its own delivery.
    fn abort(&self) -> Option<(String, CapData)> {
        if let Some(reason) = self.failure() {
            let info = kernel_error(&reason);
            return Some((reason, info));
        }
        match &self.summary.exit {
            Some((true, info)) => Some((String::from("vat exited with failure"), info.clone())),
            _ => None,
        }
    }

    fn entry(&self, delivery: VatDelivery) -> TranscriptEntry {
        TranscriptEntry {
            delivery,
            syscalls: self.summary.records.clone(),
            status: self.status.clone(),
        }
    }
}

impl<K: KvStore, T: TranscriptStore> Kernel<K, T> {
    /// Run one crank. Returns `None` when the run queue is empty.
    pub fn step(&mut self) -> CrankResult<Option<CrankOutcome>> {
        self.check_running()?;
        match self.crank() {
            Ok(outcome) => Ok(outcome),
            Err(panic) => {
                self.halt(panic.clone());
                Err(panic)
            }
        }
    }

    /// Run cranks until the queue is empty or `policy` says stop. Returns
    /// the number of cranks run.
    pub fn run(&mut self, policy: &mut dyn RunPolicy) -> CrankResult<u64> {
        let mut cranks = 0;
        if !policy.may_start() {
            return Ok(cranks);
        }
        while let Some(outcome) = self.step()? {
            cranks += 1;
            if !policy.crank_complete(&outcome) {
                break;
            }
        }
        Ok(cranks)
    }

    pub fn run_until_idle(&mut self) -> CrankResult<u64> {
        self.run(&mut Forever)
    }

    fn crank(&mut self) -> CrankResult<Option<CrankOutcome>> {
        if self.state.run_queue_len() == 0 {
            return Ok(None);
        }
        let crank = self.state.crank_number();
        let savepoint = self.state.clone();
        let Some(item) = self.state.pop_run_queue()? else {
            return Ok(None);
        };
        tracing::debug!(target: "vk_kernel::crank", crank, item = item.type_name(), "crank start");

        let outcome = match self.state.plan(item)? {
            Plan::None => CrankOutcome::KernelOnly,
            Plan::Deliver(plan) => self.deliver(crank, plan, savepoint)?,
            Plan::Terminate { vat, reject, info } => {
                if self.terminate_now(vat, reject, info)? {
                    CrankOutcome::VatTerminated { vat }
                } else {
                    CrankOutcome::KernelOnly
                }
            }
            Plan::Upgrade {
                vat,
                bundle,
                vat_parameters,
                upgrade_message,
            } => self.upgrade(crank, vat, &bundle, vat_parameters, &upgrade_message, savepoint)?,
        };
        self.finish_crank(crank)?;
        Ok(Some(outcome))
    }

    fn finish_crank(&mut self, crank: CrankNum) -> CrankResult<()> {
        self.state.process_refcounts()?;
        self.state.flush_gc_actions()?;
        self.state.record(StateChange::CrankFinished { crank })?;
        if self.config.check_invariants {
            let violations = check_all_invariants(&self.state);
            if !violations.is_empty() {
                let listing: Vec<String> = violations
                    .iter()
                    .map(|v| format!("{}: {}", v.invariant, v.description))
                    .collect();
                return Err(KernelPanic::Invariant(listing.join("; ")));
            }
        }
        self.commit(crank)?;
        Ok(())
    }

    // ========================================================================
    // Deliveries
    // ========================================================================

    fn run_delivery(
        &mut self,
        crank: CrankNum,
        vat: VatId,
        sandbox: &mut Box<dyn VatSandbox>,
        delivery: &VatDelivery,
    ) -> DeliveryRun {
        let detail = log_detail(delivery, delivery.name());
        self.gateway
            .delivery(&vat.to_string(), crank, delivery.name(), detail);
        let mut ctx = SyscallContext::new(&mut self.state, &mut self.gateway, &mut self.devices, vat, crank);
        let status = sandbox.deliver(delivery, &mut ctx);
        DeliveryRun {
            status,
            summary: ctx.finish(),
        }
    }

    fn deliver(&mut self, crank: CrankNum, plan: DeliveryPlan, savepoint: KernelState) -> CrankResult<CrankOutcome> {
        let DeliveryPlan {
            vat,
            delivery,
            consume_on_failure,
            counts_as_dirt,
        } = plan;
        tracing::debug!(target: "vk_kernel::crank", crank, %vat, delivery = delivery.name(), "deliver");
        let mut sandbox = self.vats.remove(&vat).ok_or(KernelPanic::MissingSandbox(vat))?;
        let run = self.run_delivery(crank, vat, &mut sandbox, &delivery);
        self.vats.insert(vat, sandbox);

        if let Some((reason, info)) = run.abort() {
            tracing::warn!(target: "vk_kernel::crank", crank, %vat, delivery = delivery.name(), %reason, "delivery failed, terminating vat");
            return self.abort_crank(vat, info, savepoint, consume_on_failure);
        }

        if matches!(delivery, VatDelivery::StartVat { .. }) {
            self.state.mark_running(vat)?;
        }
        if counts_as_dirt {
            self.state.note_delivery(vat)?;
        }
        let name = delivery.name();
        self.record_transcript(vat, run.entry(delivery))?;
        // A clean exit keeps the delivery's effects
        if let Some((_, info)) = run.summary.exit {
            self.terminate_now(vat, false, info)?;
            return Ok(CrankOutcome::VatTerminated { vat });
        }
        Ok(CrankOutcome::Delivered { vat, delivery: name })
    }

    /// Undo everything the crank did and terminate `vat` as failed. The
    /// item stays queued for a retry unless `consume` is set.
    fn abort_crank(
        &mut self,
        vat: VatId,
        info: CapData,
        savepoint: KernelState,
        consume: bool,
    ) -> CrankResult<CrankOutcome> {
        self.state = savepoint;
        self.pending_transcript.clear();
        self.terminate_now(vat, true, info)?;
        if consume {
            self.consume_head()?;
        }
        Ok(CrankOutcome::VatTerminated { vat })
    }

    /// Pop the item a failed crank was working on. Its vat is terminated,
    /// so planning it only releases its references.
    fn consume_head(&mut self) -> CrankResult<()> {
        if let Some(item) = self.state.pop_run_queue()? {
            if self.state.plan(item)? != Plan::None {
                return Err(KernelError::corrupt("consumed item still wants a delivery").into());
            }
        }
        Ok(())
    }

    fn record_transcript(&mut self, vat: VatId, entry: TranscriptEntry) -> CrankResult<()> {
        let uses_transcript = self
            .state
            .vat(&vat)
            .map(|r| r.options.use_transcript)
            .unwrap_or(false);
        if uses_transcript {
            let item = entry.encode().map_err(KernelError::corrupt)?;
            self.pending_transcript.push(TranscriptOp::Append(vat, item));
        }
        Ok(())
    }

    /// Terminate `vat` now. Returns `false` if it was already terminated.
    pub(crate) fn terminate_now(&mut self, vat: VatId, failure: bool, info: CapData) -> CrankResult<bool> {
        let Some(report) = self.state.terminate_vat(vat)? else {
            return Ok(false);
        };
        if report.critical {
            return Err(KernelPanic::CriticalVat(vat));
        }
        self.vats.remove(&vat);
        self.pending_transcript.push(TranscriptOp::Delete(vat));
        tracing::info!(target: "vk_kernel::lifecycle", %vat, failure, rejected = report.rejected.len(), "vat terminated");
        self.terminations.push(TerminationNotice {
            vat,
            failure,
            info,
            rejected: report.rejected,
        });
        Ok(true)
    }

    // ========================================================================
    // Upgrade
    // ========================================================================

    fn upgrade(
        &mut self,
        crank: CrankNum,
        vat: VatId,
        bundle: &str,
        vat_parameters: CapData,
        upgrade_message: &str,
        savepoint: KernelState,
    ) -> CrankResult<CrankOutcome> {
        let mut old = self.vats.remove(&vat).ok_or(KernelPanic::MissingSandbox(vat))?;
        let Some(mut new) = self.bundles.instantiate(bundle) else {
            let reason = format!("unknown bundle '{}'", bundle);
            return self.fail_upgrade(vat, old, reason, savepoint);
        };

        let boyd = self.run_delivery(crank, vat, &mut old, &VatDelivery::BringOutYourDead);
        if let Some(reason) = boyd.failure() {
            return self.fail_upgrade(vat, old, reason, savepoint);
        }
        if let Some((reason, info)) = boyd.abort() {
            tracing::warn!(target: "vk_kernel::lifecycle", %vat, %reason, "vat failed during upgrade");
            self.vats.insert(vat, old);
            return self.abort_crank(vat, info, savepoint, true);
        }
        if let Some((_, info)) = boyd.summary.exit.clone() {
            self.vats.insert(vat, old);
            self.state.decref_slots(&vat_parameters.slots)?;
            self.record_transcript(vat, boyd.entry(VatDelivery::BringOutYourDead))?;
            self.terminate_now(vat, false, info)?;
            return Ok(CrankOutcome::VatTerminated { vat });
        }

        let incarnation = self.state.begin_upgrade(vat, bundle, upgrade_message)?;
        let start = self.state.translate_start_vat(vat, &vat_parameters)?;
        self.state.decref_slots(&vat_parameters.slots)?;
        let started = self.run_delivery(crank, vat, &mut new, &start);
        if let Some(reason) = started.failure() {
            return self.fail_upgrade(vat, old, reason, savepoint);
        }
        if let Some((reason, info)) = started.abort() {
            tracing::warn!(target: "vk_kernel::lifecycle", %vat, %reason, "vat failed during upgrade");
            self.vats.insert(vat, old);
            return self.abort_crank(vat, info, savepoint, true);
        }
        self.state.mark_running(vat)?;

        if self.state.vat(&vat).map(|r| r.options.use_transcript).unwrap_or(false) {
            self.record_transcript(vat, boyd.entry(VatDelivery::BringOutYourDead))?;
            self.pending_transcript
                .push(TranscriptOp::Rollover(vat, incarnation));
            self.record_transcript(vat, started.entry(start))?;
        }
        self.vats.insert(vat, new);
        tracing::info!(target: "vk_kernel::lifecycle", %vat, incarnation, bundle, "vat upgraded");

        if let Some((_, info)) = started.summary.exit {
            self.terminate_now(vat, false, info)?;
            return Ok(CrankOutcome::VatTerminated { vat });
        }
        Ok(CrankOutcome::Upgraded { vat, incarnation })
    }

    /// Restore the old incarnation and consume the upgrade item.
    fn fail_upgrade(
        &mut self,
        vat: VatId,
        old: Box<dyn VatSandbox>,
        reason: String,
        savepoint: KernelState,
    ) -> CrankResult<CrankOutcome> {
        tracing::warn!(target: "vk_kernel::lifecycle", %vat, %reason, "upgrade failed, keeping previous incarnation");
        self.state = savepoint;
        self.pending_transcript.clear();
        self.vats.insert(vat, old);
        if let Some(RunQueueItem::UpgradeVat { vat_parameters, .. }) = self.state.pop_run_queue()? {
            self.state.decref_slots(&vat_parameters.slots)?;
        }
        Ok(CrankOutcome::UpgradeFailed { vat, reason })
    }
}
