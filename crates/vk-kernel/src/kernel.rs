//! The `Kernel`: pure tables plus everything with side effects.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Kernel                             │
//! │                                                              │
//! │  host ops ──┐        ┌─────────────┐       ┌──────────────┐  │
//! │             ├──────▶ │ KernelState │ ────▶ │ AxiomGateway │  │
//! │  step() ────┘        │  (journal)  │commit │ syslog/commit│  │
//! │     │                └─────────────┘  │    └──────────────┘  │
//! │     ▼                                 ├──▶ KvStore           │
//! │  VatSandbox / Device                  └──▶ TranscriptStore   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Host operations and cranks work the same way: take a savepoint, mutate
//! the tables (which journal every change), then commit the journal to the
//! commit log and the stores in one go. A failure before commit restores the
//! savepoint, so the stores never see a partial change.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use vk_axiom::{replay_and_verify, AxiomGateway, CommitId, CrankNum, ReplayResult};
use vk_kernel_core::{
    CapData, DeviceId, KRef, KernelError, KernelState, PromiseState, StateChange, VatId,
    VatOptions,
};
use vk_store::{KvStore, KvWrite, TranscriptStore};

use crate::config::KernelConfig;
use crate::device::Device;
use crate::error::{CrankResult, HostError, HostResult, KernelPanic};
use crate::sandbox::{BundleRegistry, VatSandbox};
use crate::transcript::{ReplayHandler, TranscriptEntry};

/// A transcript write held back until the crank commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TranscriptOp {
    Init(VatId),
    Append(VatId, String),
    Rollover(VatId, u64),
    Delete(VatId),
}

/// A vat the kernel terminated, for the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminationNotice {
    pub vat: VatId,
    /// Terminated for a failure rather than a clean exit
    pub failure: bool,
    /// Exit info or error description
    pub info: CapData,
    /// Promises rejected because the vat decided them
    pub rejected: Vec<KRef>,
}

/// The vat kernel.
pub struct Kernel<K: KvStore, T: TranscriptStore> {
    pub(crate) state: KernelState,
    pub(crate) gateway: AxiomGateway<StateChange>,
    pub(crate) kv: K,
    pub(crate) transcripts: T,
    pub(crate) bundles: BundleRegistry,
    pub(crate) vats: BTreeMap<VatId, Box<dyn VatSandbox>>,
    pub(crate) devices: BTreeMap<DeviceId, Box<dyn Device>>,
    pub(crate) config: KernelConfig,
    pub(crate) pending_transcript: Vec<TranscriptOp>,
    pub(crate) terminations: Vec<TerminationNotice>,
    pub(crate) panicked: Option<KernelPanic>,
}

impl<K: KvStore, T: TranscriptStore> Kernel<K, T> {
    /// Build a kernel over empty stores. The initial table rows (counters
    /// and queue bounds) are written to `kv` immediately.
    pub fn new(mut kv: K, transcripts: T, bundles: BundleRegistry, config: KernelConfig) -> HostResult<Self> {
        let state = KernelState::new();
        let writes: Vec<KvWrite> = state
            .kv_snapshot()?
            .into_iter()
            .map(|(key, value)| KvWrite::Set { key, value })
            .collect();
        kv.commit_batch(&writes)?;
        tracing::info!(target: "vk_kernel", rows = writes.len(), "kernel initialised");
        Ok(Kernel {
            state,
            gateway: AxiomGateway::with_capacity(config.syslog_capacity, config.commitlog_capacity),
            kv,
            transcripts,
            bundles,
            vats: BTreeMap::new(),
            devices: BTreeMap::new(),
            config,
            pending_transcript: Vec::new(),
            terminations: Vec::new(),
            panicked: None,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> &KernelState {
        &self.state
    }

    pub fn gateway(&self) -> &AxiomGateway<StateChange> {
        &self.gateway
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    pub fn transcripts(&self) -> &T {
        &self.transcripts
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn bundles_mut(&mut self) -> &mut BundleRegistry {
        &mut self.bundles
    }

    /// The panic that halted the kernel, if any.
    pub fn panicked(&self) -> Option<&KernelPanic> {
        self.panicked.as_ref()
    }

    /// Terminations since the last call.
    pub fn take_terminations(&mut self) -> Vec<TerminationNotice> {
        core::mem::take(&mut self.terminations)
    }

    pub fn vat_root(&self, vat: VatId) -> Option<KRef> {
        self.state.vat_root(vat)
    }

    pub fn vat_by_name(&self, name: &str) -> Option<VatId> {
        self.state.vat_by_name(name)
    }

    /// State and resolution data of a promise.
    pub fn kpid_status(&self, kpid: KRef) -> HostResult<(PromiseState, Option<CapData>)> {
        let promise = self.state.kernel_promise(&kpid)?;
        Ok((promise.state, promise.data.clone()))
    }

    // ========================================================================
    // Host operations
    // ========================================================================

    /// Create a vat running `bundle` and queue its `startVat`.
    ///
    /// Config defaults fill in the reap interval and pipelining.
    pub fn create_vat(
        &mut self,
        name: &str,
        bundle: &str,
        mut options: VatOptions,
        vat_parameters: CapData,
    ) -> HostResult<(VatId, KRef)> {
        if !self.bundles.contains(bundle) {
            return Err(HostError::UnknownBundle(String::from(bundle)));
        }
        if options.reap_interval.is_none() {
            options.reap_interval = self.config.default_reap_interval;
        }
        if self.config.default_enable_pipelining {
            options.enable_pipelining = true;
        }
        let use_transcript = options.use_transcript;
        self.host_op(|k| {
            let (vat, root) = k.state.create_vat(name, bundle, options, vat_parameters)?;
            let sandbox = k
                .bundles
                .instantiate(bundle)
                .ok_or_else(|| HostError::UnknownBundle(String::from(bundle)))?;
            k.vats.insert(vat, sandbox);
            if use_transcript {
                k.pending_transcript.push(TranscriptOp::Init(vat));
            }
            tracing::info!(target: "vk_kernel::lifecycle", %vat, name, bundle, %root, "vat created");
            Ok((vat, root))
        })
    }

    /// Attach a device and export its root node.
    pub fn create_device(&mut self, name: &str, device: Box<dyn Device>) -> HostResult<(DeviceId, KRef)> {
        let (id, root) = self.host_op(|k| Ok(k.state.create_device(name)?))?;
        self.devices.insert(id, device);
        tracing::info!(target: "vk_kernel::lifecycle", device = %id, name, %root, "device created");
        Ok((id, root))
    }

    /// Queue a message from the host. With `want_result` the result promise
    /// is held for the host until [`Kernel::release_kpid`].
    pub fn queue_to_kref(&mut self, target: KRef, methargs: CapData, want_result: bool) -> HostResult<Option<KRef>> {
        self.host_op(|k| Ok(k.state.queue_to_kref(target, methargs, want_result)?))
    }

    /// Drop the host's hold on a promise.
    pub fn release_kpid(&mut self, kpid: KRef) -> HostResult<()> {
        self.host_op(|k| {
            k.state.release_kpid(kpid)?;
            k.state.process_refcounts()?;
            k.state.flush_gc_actions()?;
            Ok(())
        })
    }

    /// Queue a termination. `reject` marks it as a failure in the notice.
    pub fn terminate_vat(&mut self, vat: VatId, reject: bool, info: CapData) -> HostResult<()> {
        self.host_op(|k| Ok(k.state.request_termination(vat, reject, info)?))
    }

    /// Queue an upgrade of `vat` to `bundle`.
    pub fn upgrade_vat(
        &mut self,
        vat: VatId,
        bundle: &str,
        vat_parameters: CapData,
        upgrade_message: &str,
    ) -> HostResult<()> {
        if !self.bundles.contains(bundle) {
            return Err(HostError::UnknownBundle(String::from(bundle)));
        }
        self.host_op(|k| {
            Ok(k.state
                .request_upgrade(vat, bundle, vat_parameters, upgrade_message)?)
        })
    }

    fn host_op<R>(&mut self, op: impl FnOnce(&mut Self) -> HostResult<R>) -> HostResult<R> {
        self.check_running()?;
        let savepoint = self.state.clone();
        match op(self) {
            Ok(value) => {
                let crank = self.state.crank_number();
                if let Err(panic) = self.commit(crank) {
                    self.halt(panic.clone());
                    return Err(panic.into());
                }
                Ok(value)
            }
            Err(e) => {
                self.state = savepoint;
                self.pending_transcript.clear();
                Err(e)
            }
        }
    }

    // ========================================================================
    // Commit
    // ========================================================================

    pub(crate) fn check_running(&self) -> CrankResult<()> {
        match &self.panicked {
            Some(panic) => Err(KernelPanic::Halted(panic.to_string())),
            None => Ok(()),
        }
    }

    pub(crate) fn halt(&mut self, panic: KernelPanic) {
        tracing::error!(target: "vk_kernel", %panic, "kernel panic");
        self.panicked = Some(panic);
    }

    /// Write the journal to the KV store, apply held-back transcript
    /// writes and append the commit log.
    pub(crate) fn commit(&mut self, crank: CrankNum) -> CrankResult<CommitId> {
        let changes = self.state.take_journal();
        let writes: Vec<KvWrite> = self
            .state
            .kv_writes(&changes)?
            .into_iter()
            .map(|(key, value)| KvWrite::from_pair(key, value))
            .collect();
        self.kv.commit_batch(&writes)?;

        for op in core::mem::take(&mut self.pending_transcript) {
            match op {
                TranscriptOp::Init(vat) => {
                    self.transcripts.init_transcript(&vat.to_string())?;
                }
                TranscriptOp::Append(vat, item) => {
                    self.transcripts.append(&vat.to_string(), item)?;
                }
                TranscriptOp::Rollover(vat, incarnation) => {
                    self.transcripts.rollover(&vat.to_string(), incarnation)?;
                }
                TranscriptOp::Delete(vat) => {
                    let key = vat.to_string();
                    if self.transcripts.has_transcript(&key) {
                        self.transcripts.delete_transcript(&key)?;
                    }
                }
            }
        }

        let commit = self
            .gateway
            .commit_crank(crank, changes, self.state.compute_hash());
        tracing::debug!(target: "vk_kernel::commit", crank, kv_writes = writes.len(), "crank committed");
        Ok(commit)
    }

    // ========================================================================
    // Replay
    // ========================================================================

    /// Rebuild the tables from the commit log and check they hash the same
    /// as the live state.
    pub fn verify_replay(&self) -> ReplayResult<()> {
        let mut fresh = KernelState::new();
        replay_and_verify(&mut fresh, self.gateway.commitlog().commits(), self.state.compute_hash())
    }

    /// Replace a vat's sandbox with a fresh one rebuilt from the current
    /// transcript span. Returns the number of deliveries replayed.
    pub fn reload_vat(&mut self, vat: VatId) -> HostResult<usize> {
        self.check_running()?;
        let record = self
            .state
            .vat(&vat)
            .ok_or_else(|| KernelError::UnknownVat(vat.to_string()))?;
        if !self.state.is_vat_alive(&vat) {
            return Err(KernelError::VatTerminated(vat).into());
        }
        let bundle = record.bundle.clone();
        let mut sandbox = self
            .bundles
            .instantiate(&bundle)
            .ok_or_else(|| HostError::UnknownBundle(bundle.clone()))?;

        let key = vat.to_string();
        let span = self.transcripts.current_span(&key)?;
        let items = self.transcripts.read_span(&key, &span)?;
        for (offset, item) in items.iter().enumerate() {
            let pos = span.start_pos + offset as u64;
            let mismatch = |detail: String| HostError::TranscriptMismatch { vat, pos, detail };
            let entry = TranscriptEntry::decode(item).map_err(&mismatch)?;
            let mut handler = ReplayHandler::new(&entry.syscalls);
            let status = sandbox.deliver(&entry.delivery, &mut handler);
            if let Some(detail) = handler.finish() {
                return Err(mismatch(detail));
            }
            if status != entry.status {
                return Err(mismatch(format!("delivery ended {:?}, transcript has {:?}", status, entry.status)));
            }
        }
        self.vats.insert(vat, sandbox);
        tracing::info!(target: "vk_kernel::lifecycle", %vat, deliveries = items.len(), "vat reloaded from transcript");
        Ok(items.len())
    }
}
