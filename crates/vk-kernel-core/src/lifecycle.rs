//! Vat and device lifecycle.
//!
//! ```text
//!   create ──▶ Starting ──startVat ok──▶ Running ──upgradeVat──▶ Upgrading
//!                 │                        ▲  │                    │
//!                 │                        │  │           startVat ok
//!                 │                        └──┼────────────────────┘
//!                 └──────────── fatal ────────┴──▶ Terminated
//! ```
//!
//! Termination is immediate and complete: every promise the vat decided is
//! rejected, every export is abandoned, every other c-list row released and
//! the vatstore cleared. Nothing is ever delivered to a terminated vat.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::queue::RunQueueItem;
use crate::state::{KernelState, StateChange};
use crate::translate::MapOptions;
use crate::types::{
    kernel_error, upgrade_disconnection, CapData, DeviceId, KRef, Participant, VRef, VatId,
    VAT_TERMINATED,
};

// ============================================================================
// Records
// ============================================================================

/// Where a vat is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VatStatus {
    Starting,
    Running,
    Upgrading,
    Terminated,
}

impl VatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VatStatus::Starting => "starting",
            VatStatus::Running => "running",
            VatStatus::Upgrading => "upgrading",
            VatStatus::Terminated => "terminated",
        }
    }
}

/// Per-vat options. Every field has a default, so `{}` is valid JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VatOptions {
    /// Deliver messages for promises this vat decides before they settle
    pub enable_pipelining: bool,
    /// Terminating this vat panics the kernel
    pub critical: bool,
    /// Deliveries between `bringOutYourDead`; `None` never reaps
    pub reap_interval: Option<u64>,
    /// Record deliveries in the transcript store
    pub use_transcript: bool,
}

impl Default for VatOptions {
    fn default() -> Self {
        VatOptions {
            enable_pipelining: false,
            critical: false,
            reap_interval: None,
            use_transcript: true,
        }
    }
}

/// The kernel's record of one vat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatRecord {
    pub name: String,
    pub options: VatOptions,
    pub status: VatStatus,
    /// Starts at 0, +1 per upgrade
    pub incarnation: u64,
    /// Bundle the current incarnation runs
    pub bundle: String,
    /// Deliveries since the last reap
    pub deliveries_since_reap: u64,
}

impl VatRecord {
    pub fn new(name: impl Into<String>, bundle: impl Into<String>, options: VatOptions) -> Self {
        VatRecord {
            name: name.into(),
            options,
            status: VatStatus::Starting,
            incarnation: 0,
            bundle: bundle.into(),
            deliveries_since_reap: 0,
        }
    }
}

/// The kernel's record of one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
}

/// What a termination did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminationReport {
    pub vat: VatId,
    /// The vat was critical: the kernel must panic
    pub critical: bool,
    /// Promises rejected because the vat decided them
    pub rejected: Vec<KRef>,
}

// ============================================================================
// Lifecycle operations
// ============================================================================

impl KernelState {
    fn vat_record(&self, vat: &VatId) -> KernelResult<&VatRecord> {
        self.vats
            .get(vat)
            .ok_or_else(|| KernelError::UnknownVat(alloc::format!("{}", vat)))
    }

    /// Create a vat: allocate its ID, export and pin its root object, and
    /// queue `startVat`.
    pub fn create_vat(
        &mut self,
        name: &str,
        bundle: &str,
        options: VatOptions,
        vat_parameters: CapData,
    ) -> KernelResult<(VatId, KRef)> {
        for slot in &vat_parameters.slots {
            if !self.kref_exists(slot) {
                return Err(KernelError::UnknownKref(*slot));
            }
        }
        let vat = VatId(self.next_vat_id);
        self.record(StateChange::VatCreated {
            vat,
            record: VatRecord::new(name, bundle, options),
        })?;
        let root = self.map_vat_slot_to_kernel(Participant::Vat(vat), VRef::root(), MapOptions::DEFAULT)?;
        self.pin_object(root)?;
        self.incref_slots(&vat_parameters.slots)?;
        self.push_run_queue(RunQueueItem::StartVat {
            vat,
            vat_parameters,
        })?;
        Ok((vat, root))
    }

    /// Create a device and export its root node `d+0`.
    pub fn create_device(&mut self, name: &str) -> KernelResult<(DeviceId, KRef)> {
        let device = DeviceId(self.next_device_id);
        self.record(StateChange::DeviceCreated {
            device,
            record: DeviceRecord {
                name: String::from(name),
            },
        })?;
        let root = self.map_vat_slot_to_kernel(
            Participant::Device(device),
            VRef::device_export(0),
            MapOptions::DEFAULT,
        )?;
        Ok((device, root))
    }

    /// Kref of a vat's root object.
    pub fn vat_root(&self, vat: VatId) -> Option<KRef> {
        self.lookup_vref(&Participant::Vat(vat), &VRef::root())
    }

    /// Kref of a device's root node.
    pub fn device_root(&self, device: DeviceId) -> Option<KRef> {
        self.lookup_vref(&Participant::Device(device), &VRef::device_export(0))
    }

    /// Find a live vat by name.
    pub fn vat_by_name(&self, name: &str) -> Option<VatId> {
        self.vats
            .iter()
            .find(|(_, r)| r.name == name && r.status != VatStatus::Terminated)
            .map(|(v, _)| *v)
    }

    /// Queue a host-requested termination.
    pub fn request_termination(&mut self, vat: VatId, reject: bool, info: CapData) -> KernelResult<()> {
        self.vat_record(&vat)?;
        self.incref_slots(&info.slots)?;
        self.push_run_queue(RunQueueItem::TerminateVat { vat, reject, info })
    }

    /// Queue an upgrade to a new bundle.
    pub fn request_upgrade(
        &mut self,
        vat: VatId,
        bundle: &str,
        vat_parameters: CapData,
        upgrade_message: &str,
    ) -> KernelResult<()> {
        if !self.is_vat_alive(&vat) {
            return Err(KernelError::VatTerminated(vat));
        }
        self.incref_slots(&vat_parameters.slots)?;
        self.push_run_queue(RunQueueItem::UpgradeVat {
            vat,
            bundle: String::from(bundle),
            vat_parameters,
            upgrade_message: String::from(upgrade_message),
        })
    }

    /// Terminate a vat now. Returns `None` if it was already terminated.
    pub fn terminate_vat(&mut self, vat: VatId) -> KernelResult<Option<TerminationReport>> {
        if !self.is_vat_alive(&vat) {
            self.vat_record(&vat)?;
            return Ok(None);
        }
        let critical = self.vat_record(&vat)?.options.critical;
        let dead = self.enumerate_promises_by_decider(vat);
        self.record(StateChange::VatStatusChanged {
            vat,
            status: VatStatus::Terminated,
        })?;
        for kpid in &dead {
            self.resolve_to_error(*kpid, kernel_error(VAT_TERMINATED), Some(vat))?;
        }

        let participant = Participant::Vat(vat);
        let rows: Vec<(KRef, VRef)> = self
            .clists
            .get(&participant)
            .map(|c| c.entries().map(|(k, e)| (*k, e.vref)).collect())
            .unwrap_or_default();
        for (kref, vref) in rows {
            let owned = kref.is_object()
                && vref.allocated_by_vat
                && self.objects.get(&kref).and_then(|o| o.owner) == Some(vat);
            if owned {
                self.orphan_kernel_object(kref, vat)?;
            } else if self.clist_entry(&participant, &kref).is_some() {
                self.delete_clist_entry(participant, kref)?;
            }
        }

        let keys: Vec<String> = self
            .vatstore
            .get(&vat)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        if !keys.is_empty() {
            self.record(StateChange::VatstoreCleared { vat, keys })?;
        }

        Ok(Some(TerminationReport {
            vat,
            critical,
            rejected: dead,
        }))
    }

    /// Retire the current incarnation's ephemeral state and move to the
    /// next incarnation. Returns the new incarnation number.
    ///
    /// Decided promises are rejected with an upgrade disconnection; exports
    /// other than the root and durable objects are abandoned; import rows
    /// for objects that no longer exist are dropped.
    pub fn begin_upgrade(&mut self, vat: VatId, bundle: &str, upgrade_message: &str) -> KernelResult<u64> {
        if !self.is_vat_alive(&vat) {
            return Err(KernelError::VatTerminated(vat));
        }
        let old = self.vat_record(&vat)?.incarnation;

        let disconnection = upgrade_disconnection(upgrade_message, old);
        for kpid in self.enumerate_promises_by_decider(vat) {
            self.resolve_to_error(kpid, disconnection.clone(), Some(vat))?;
        }

        let participant = Participant::Vat(vat);
        let rows: Vec<(KRef, VRef)> = self
            .clists
            .get(&participant)
            .map(|c| c.entries().map(|(k, e)| (*k, e.vref)).collect())
            .unwrap_or_default();
        for (kref, vref) in rows {
            if !kref.is_object() {
                continue;
            }
            if vref.allocated_by_vat {
                if !vref.survives_upgrade() {
                    self.orphan_kernel_object(kref, vat)?;
                }
            } else if !self.objects.contains_key(&kref) {
                self.delete_clist_entry(participant, kref)?;
            }
        }

        let incarnation = old + 1;
        self.record(StateChange::VatIncarnation {
            vat,
            incarnation,
            bundle: String::from(bundle),
        })?;
        self.record(StateChange::VatStatusChanged {
            vat,
            status: VatStatus::Upgrading,
        })?;
        Ok(incarnation)
    }

    /// A `startVat` delivery succeeded.
    pub fn mark_running(&mut self, vat: VatId) -> KernelResult<()> {
        if self.vat_record(&vat)?.status == VatStatus::Running {
            return Ok(());
        }
        self.record(StateChange::VatStatusChanged {
            vat,
            status: VatStatus::Running,
        })
    }

    /// Count a delivery toward the vat's reap interval, queueing
    /// `bringOutYourDead` when it is reached.
    pub fn note_delivery(&mut self, vat: VatId) -> KernelResult<()> {
        if !self.is_vat_alive(&vat) {
            return Ok(());
        }
        let record = self.vat_record(&vat)?;
        let Some(interval) = record.options.reap_interval else {
            return Ok(());
        };
        let deliveries = record.deliveries_since_reap + 1;
        if deliveries >= interval {
            self.record(StateChange::VatDirt { vat, deliveries: 0 })?;
            self.push_run_queue(RunQueueItem::BringOutYourDead { vat })
        } else {
            self.record(StateChange::VatDirt { vat, deliveries })
        }
    }

    /// A `bringOutYourDead` was delivered.
    pub fn reset_dirt(&mut self, vat: VatId) -> KernelResult<()> {
        if self.vat_record(&vat)?.deliveries_since_reap == 0 {
            return Ok(());
        }
        self.record(StateChange::VatDirt { vat, deliveries: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::PromiseState;
    use crate::types::RefCounts;

    fn params() -> CapData {
        CapData::bare("#{}")
    }

    #[test]
    fn test_create_vat_pins_root_and_queues_start() {
        let mut state = KernelState::new();
        let (vat, root) = state
            .create_vat("alice", "bundle-a", VatOptions::default(), params())
            .unwrap();
        assert_eq!(vat, VatId(1));
        assert_eq!(root, KRef::Object(20));
        assert_eq!(state.vat_root(vat), Some(root));
        assert_eq!(state.object(&root).unwrap().counts, RefCounts::new(1, 1));
        assert!(matches!(
            state.run_queue().front(),
            Some(RunQueueItem::StartVat { .. })
        ));
        assert_eq!(state.vat(&vat).unwrap().status, VatStatus::Starting);

        state.process_refcounts().unwrap();
        state.flush_gc_actions().unwrap();
        crate::invariants::assert_invariants(&state);
    }

    #[test]
    fn test_vat_options_defaults_from_json() {
        let opts: VatOptions = serde_json::from_str(r#"{"critical":true}"#).unwrap();
        assert!(opts.critical);
        assert!(opts.use_transcript);
        assert_eq!(opts.reap_interval, None);
    }

    #[test]
    fn test_terminate_rejects_and_orphans() {
        let mut state = KernelState::new();
        let (a, root_a) = state
            .create_vat("a", "b", VatOptions::default(), params())
            .unwrap();
        let (b, _) = state
            .create_vat("b", "b", VatOptions::default(), params())
            .unwrap();

        let kp = state.add_kernel_promise(Some(a)).unwrap();
        state.add_subscriber(kp, b).unwrap();
        state.vatstore.entry(a).or_default().insert("k".into(), "v".into());

        let report = state.terminate_vat(a).unwrap().unwrap();
        assert_eq!(report.rejected, alloc::vec![kp]);
        assert!(!report.critical);

        let p = state.promise(&kp).unwrap();
        assert_eq!(p.state, PromiseState::Rejected);
        assert_eq!(p.data, Some(kernel_error(VAT_TERMINATED)));
        assert_eq!(state.object(&root_a).unwrap().owner, None);
        assert!(state.clist(&Participant::Vat(a)).unwrap().is_empty());
        assert_eq!(state.vatstore_len(&a), 0);

        // Second termination is a no-op
        assert_eq!(state.terminate_vat(a).unwrap(), None);
    }

    #[test]
    fn test_upgrade_keeps_durable_exports() {
        let mut state = KernelState::new();
        let (a, root) = state
            .create_vat("a", "b1", VatOptions::default(), params())
            .unwrap();
        let me = Participant::Vat(a);
        let plain = state
            .map_vat_slot_to_kernel(me, VRef::object_export(3), MapOptions::DEFAULT)
            .unwrap();
        let durable = state
            .map_vat_slot_to_kernel(me, VRef::durable_object(2, 1), MapOptions::DEFAULT)
            .unwrap();
        let kp = state.add_kernel_promise(Some(a)).unwrap();

        let incarnation = state.begin_upgrade(a, "b2", "bye").unwrap();
        assert_eq!(incarnation, 1);

        assert_eq!(state.owner_of(&root), Some(a));
        assert_eq!(state.owner_of(&durable), Some(a));
        assert!(state.object(&plain).map(|o| o.owner.is_none()).unwrap_or(true));
        assert_eq!(
            state.promise(&kp).unwrap().data,
            Some(upgrade_disconnection("bye", 0))
        );
        let record = state.vat(&a).unwrap();
        assert_eq!(record.bundle, "b2");
        assert_eq!(record.status, VatStatus::Upgrading);
    }

    #[test]
    fn test_reap_interval_queues_boyd() {
        let mut state = KernelState::new();
        let opts = VatOptions {
            reap_interval: Some(2),
            ..VatOptions::default()
        };
        let (a, _) = state.create_vat("a", "b", opts, params()).unwrap();
        state.pop_run_queue().unwrap();

        state.note_delivery(a).unwrap();
        assert_eq!(state.run_queue_len(), 0);
        state.note_delivery(a).unwrap();
        assert_eq!(
            state.run_queue().front(),
            Some(&RunQueueItem::BringOutYourDead { vat: a })
        );
        assert_eq!(state.vat(&a).unwrap().deliveries_since_reap, 0);
    }
}
