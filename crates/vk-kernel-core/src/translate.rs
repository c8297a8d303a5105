//! C-list translation between participant references and krefs.
//!
//! Two directions, each with a refcount side effect on first contact:
//!
//! ```text
//!   vat -> kernel   o+N / p+N / d+N first seen: allocate ko / kp / kd
//!                   o-N / p-N / d-N unknown:    UnknownReference
//!   kernel -> vat   kref first seen:            allocate o-N / p-N / d-N,
//!                                               count it recognizable
//! ```
//!
//! The reachable flag on a row is the participant's strong hold. Turning it
//! on or off moves the object's reachable count, for imports only.

use alloc::format;
use alloc::string::ToString;
use alloc::vec::Vec;

use crate::clist::CListEntry;
use crate::error::{KernelError, KernelResult};
use crate::queue::GcKind;
use crate::state::{KernelState, StateChange};
use crate::syscall::{check_vatstore_key, KernelSyscall, VatDelivery, VatSyscall};
use crate::table::RefOptions;
use crate::types::{CapData, KRef, Message, Participant, RefType, Resolution, VRef, VatId};

/// Options for mapping a reference through a c-list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapOptions {
    /// Mark (or require) the row reachable
    pub set_reachable: bool,
    /// The row must already exist
    pub required: bool,
}

impl MapOptions {
    /// Ordinary message traffic.
    pub const DEFAULT: MapOptions = MapOptions {
        set_reachable: true,
        required: false,
    };
    /// GC syscalls and GC deliveries.
    pub const GC: MapOptions = MapOptions {
        set_reachable: false,
        required: true,
    };
}

impl KernelState {
    // ========================================================================
    // Row primitives
    // ========================================================================

    /// The row a participant has for `kref`.
    pub fn clist_entry(&self, participant: &Participant, kref: &KRef) -> Option<CListEntry> {
        self.clists.get(participant)?.get(kref).copied()
    }

    fn required_entry(&self, participant: Participant, kref: KRef) -> KernelResult<CListEntry> {
        self.clist_entry(&participant, &kref).ok_or_else(|| {
            KernelError::corrupt(format!("{} has no c-list row for {}", participant, kref))
        })
    }

    /// Mark a row reachable. An import moving to reachable counts once.
    pub fn set_reachable_flag(&mut self, participant: Participant, kref: KRef) -> KernelResult<()> {
        let entry = self.required_entry(participant, kref)?;
        if entry.reachable {
            return Ok(());
        }
        self.record(StateChange::CListReachable {
            participant,
            kref,
            reachable: true,
        })?;
        if kref.is_object() && !entry.vref.allocated_by_vat {
            self.adjust_reachable(kref, true)?;
        }
        Ok(())
    }

    /// Mark a row unreachable.
    pub fn clear_reachable_flag(&mut self, participant: Participant, kref: KRef) -> KernelResult<()> {
        let entry = self.required_entry(participant, kref)?;
        if !entry.reachable {
            return Ok(());
        }
        self.record(StateChange::CListReachable {
            participant,
            kref,
            reachable: false,
        })?;
        if kref.is_object() && !entry.vref.allocated_by_vat {
            self.adjust_reachable(kref, false)?;
        }
        Ok(())
    }

    /// Remove a row and release the references it held.
    pub fn delete_clist_entry(&mut self, participant: Participant, kref: KRef) -> KernelResult<()> {
        let entry = self.required_entry(participant, kref)?;
        self.record(StateChange::CListRemoved {
            participant,
            kref,
            vref: entry.vref,
        })?;
        self.decref(
            kref,
            RefOptions {
                is_export: entry.vref.allocated_by_vat,
                only_recognizable: !entry.reachable,
            },
        )
    }

    /// Remove whichever of these rows exist.
    pub fn delete_clist_entries_for_kernel_slots(
        &mut self,
        participant: Participant,
        krefs: &[KRef],
    ) -> KernelResult<()> {
        for kref in krefs {
            if self.clist_entry(&participant, kref).is_some() {
                self.delete_clist_entry(participant, *kref)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// Translate a participant reference into a kref.
    pub fn map_vat_slot_to_kernel(
        &mut self,
        participant: Participant,
        vref: VRef,
        opts: MapOptions,
    ) -> KernelResult<KRef> {
        let existing = self
            .clists
            .get(&participant)
            .and_then(|c| c.kref_for(&vref));
        let kref = match existing {
            Some(kref) => kref,
            None => {
                if !vref.allocated_by_vat || opts.required {
                    return Err(KernelError::UnknownReference {
                        participant: participant.to_string(),
                        vref: vref.to_string(),
                    });
                }
                let kref = match (vref.ref_type, participant) {
                    (RefType::Object, Participant::Vat(vat)) => self.add_kernel_object(vat)?,
                    (RefType::Promise, Participant::Vat(vat)) => {
                        self.add_kernel_promise(Some(vat))?
                    }
                    (RefType::Device, Participant::Device(device)) => {
                        self.add_device_node(device)?
                    }
                    _ => {
                        return Err(KernelError::illegal(format!(
                            "{} cannot export {}",
                            participant, vref
                        )))
                    }
                };
                self.incref(kref, RefOptions::EXPORT)?;
                self.record(StateChange::CListAdded {
                    participant,
                    kref,
                    vref,
                    reachable: false,
                })?;
                kref
            }
        };

        if opts.set_reachable {
            if vref.allocated_by_vat {
                self.set_reachable_flag(participant, kref)?;
            } else if !self.required_entry(participant, kref)?.reachable {
                return Err(KernelError::UnreachableImport {
                    participant: participant.to_string(),
                    vref: vref.to_string(),
                });
            }
        }
        Ok(kref)
    }

    /// Translate a kref into a participant reference, importing it if the
    /// participant has never seen it.
    pub fn map_kernel_slot_to_vat(
        &mut self,
        participant: Participant,
        kref: KRef,
        opts: MapOptions,
    ) -> KernelResult<VRef> {
        let vref = match self.clist_entry(&participant, &kref) {
            Some(entry) => entry.vref,
            None => {
                if opts.required {
                    return Err(KernelError::corrupt(format!(
                        "{} has no c-list row for {}",
                        participant, kref
                    )));
                }
                if !self.kref_exists(&kref) {
                    return Err(KernelError::UnknownKref(kref));
                }
                let vref = self
                    .clists
                    .entry(participant)
                    .or_default()
                    .peek_import(kref.ref_type());
                self.incref(kref, RefOptions::RECOGNIZABLE)?;
                self.record(StateChange::CListAdded {
                    participant,
                    kref,
                    vref,
                    reachable: false,
                })?;
                vref
            }
        };
        if opts.set_reachable {
            self.set_reachable_flag(participant, kref)?;
        }
        Ok(vref)
    }

    /// Look up a vref without side effects.
    pub fn lookup_vref(&self, participant: &Participant, vref: &VRef) -> Option<KRef> {
        self.clists.get(participant)?.kref_for(vref)
    }

    fn map_in(&mut self, participant: Participant, slots: &CapData<VRef>) -> KernelResult<CapData> {
        slots.try_map_slots(|v| self.map_vat_slot_to_kernel(participant, *v, MapOptions::DEFAULT))
    }

    fn map_out(&mut self, participant: Participant, slots: &CapData) -> KernelResult<CapData<VRef>> {
        slots.try_map_slots(|k| self.map_kernel_slot_to_vat(participant, *k, MapOptions::DEFAULT))
    }

    // ========================================================================
    // Syscall translation
    // ========================================================================

    /// Translate a vat syscall into kernel space.
    ///
    /// GC syscalls do their c-list work here.
    pub fn translate_syscall(&mut self, vat: VatId, vsc: &VatSyscall) -> KernelResult<KernelSyscall> {
        let me = Participant::Vat(vat);
        match vsc {
            VatSyscall::Send { target, msg } => {
                let target = self.map_vat_slot_to_kernel(me, *target, MapOptions::DEFAULT)?;
                let methargs = self.map_in(me, &msg.methargs)?;
                let result = match msg.result {
                    Some(vpid) => {
                        vpid.expect_type(RefType::Promise)?;
                        let kpid = self.map_vat_slot_to_kernel(me, vpid, MapOptions::DEFAULT)?;
                        let p = self.kernel_promise(&kpid)?;
                        if !p.is_unresolved() {
                            return Err(KernelError::AlreadyResolved(kpid));
                        }
                        if p.decider != Some(vat) {
                            return Err(KernelError::NotDecider {
                                kpid,
                                expected: Some(vat),
                                actual: p.decider,
                            });
                        }
                        // Resolution authority now rides with the message
                        self.set_decider(kpid, None)?;
                        Some(kpid)
                    }
                    None => None,
                };
                Ok(KernelSyscall::Send {
                    target,
                    msg: Message::new(methargs, result),
                })
            }
            VatSyscall::Subscribe { vpid } => {
                vpid.expect_type(RefType::Promise)?;
                let kpid = self.map_vat_slot_to_kernel(me, *vpid, MapOptions::DEFAULT)?;
                Ok(KernelSyscall::Subscribe { vat, kpid })
            }
            VatSyscall::Resolve { resolutions } => {
                let mut kresolutions = Vec::with_capacity(resolutions.len());
                let mut resolved = Vec::with_capacity(resolutions.len());
                for r in resolutions {
                    r.promise.expect_type(RefType::Promise)?;
                    let kpid = self.map_vat_slot_to_kernel(me, r.promise, MapOptions::DEFAULT)?;
                    let data = self.map_in(me, &r.data)?;
                    kresolutions.push(Resolution {
                        promise: kpid,
                        rejected: r.rejected,
                        data,
                    });
                    resolved.push(kpid);
                }
                self.delete_clist_entries_for_kernel_slots(me, &resolved)?;
                Ok(KernelSyscall::Resolve {
                    vat,
                    resolutions: kresolutions,
                })
            }
            VatSyscall::Exit { failure, info } => {
                let info = self.map_in(me, info)?;
                Ok(KernelSyscall::Exit {
                    vat,
                    failure: *failure,
                    info,
                })
            }
            VatSyscall::DropImports { vrefs } => {
                let mut krefs = Vec::with_capacity(vrefs.len());
                for vref in vrefs {
                    require_object(vref, false, "dropImports")?;
                    let kref = self.map_vat_slot_to_kernel(me, *vref, MapOptions::GC)?;
                    self.clear_reachable_flag(me, kref)?;
                    krefs.push(kref);
                }
                Ok(KernelSyscall::DropImports { krefs })
            }
            VatSyscall::RetireImports { vrefs } => {
                let mut krefs = Vec::with_capacity(vrefs.len());
                for vref in vrefs {
                    require_object(vref, false, "retireImports")?;
                    let kref = self.map_vat_slot_to_kernel(me, *vref, MapOptions::GC)?;
                    if self.required_entry(me, kref)?.reachable {
                        return Err(KernelError::illegal(format!(
                            "retireImports but {} is still reachable",
                            vref
                        )));
                    }
                    self.delete_clist_entry(me, kref)?;
                    krefs.push(kref);
                }
                Ok(KernelSyscall::RetireImports { krefs })
            }
            VatSyscall::RetireExports { vrefs } => {
                let mut krefs = Vec::with_capacity(vrefs.len());
                for vref in vrefs {
                    require_object(vref, true, "retireExports")?;
                    let kref = self.map_vat_slot_to_kernel(me, *vref, MapOptions::GC)?;
                    let still_reachable = self.required_entry(me, kref)?.reachable
                        || self
                            .objects
                            .get(&kref)
                            .map(|o| o.counts.reachable > 0)
                            .unwrap_or(false);
                    if still_reachable {
                        return Err(KernelError::illegal(format!(
                            "retireExports but {} is still reachable",
                            vref
                        )));
                    }
                    self.delete_clist_entry(me, kref)?;
                    krefs.push(kref);
                }
                Ok(KernelSyscall::RetireExports { krefs })
            }
            VatSyscall::AbandonExports { vrefs } => {
                let mut krefs = Vec::with_capacity(vrefs.len());
                for vref in vrefs {
                    require_object(vref, true, "abandonExports")?;
                    krefs.push(self.map_vat_slot_to_kernel(me, *vref, MapOptions::GC)?);
                }
                Ok(KernelSyscall::AbandonExports { vat, krefs })
            }
            VatSyscall::CallNow { target, methargs } => {
                target.expect_type(RefType::Device)?;
                if let Some(p) = methargs.slots.iter().find(|s| s.ref_type == RefType::Promise) {
                    return Err(KernelError::illegal(format!(
                        "callNow() args cannot include promises like {}",
                        p
                    )));
                }
                let kref = self.map_vat_slot_to_kernel(me, *target, MapOptions::DEFAULT)?;
                let device = self.device_node_owner(&kref).ok_or(KernelError::UnknownKref(kref))?;
                let methargs = self.map_in(me, methargs)?;
                Ok(KernelSyscall::Invoke {
                    device,
                    target: kref,
                    methargs,
                })
            }
            VatSyscall::VatstoreGet { key } => {
                check_vatstore_key(key)?;
                Ok(KernelSyscall::VatstoreGet {
                    vat,
                    key: key.clone(),
                })
            }
            VatSyscall::VatstoreSet { key, value } => {
                check_vatstore_key(key)?;
                Ok(KernelSyscall::VatstoreSet {
                    vat,
                    key: key.clone(),
                    value: value.clone(),
                })
            }
            VatSyscall::VatstoreDelete { key } => {
                check_vatstore_key(key)?;
                Ok(KernelSyscall::VatstoreDelete {
                    vat,
                    key: key.clone(),
                })
            }
            VatSyscall::VatstoreGetNextKey { prior } => Ok(KernelSyscall::VatstoreGetNextKey {
                vat,
                prior: prior.clone(),
            }),
        }
    }

    /// Translate capdata a device returned from `invoke` back into the
    /// calling vat's space.
    pub fn translate_invoke_result(
        &mut self,
        device: crate::types::DeviceId,
        vat: VatId,
        result: &CapData<VRef>,
    ) -> KernelResult<CapData<VRef>> {
        let kdata = self.translate_device_data(device, result)?;
        self.map_out(Participant::Vat(vat), &kdata)
    }

    /// Translate capdata into a device's reference space for `invoke`.
    pub fn translate_device_args(
        &mut self,
        device: crate::types::DeviceId,
        target: KRef,
        methargs: &CapData,
    ) -> KernelResult<(VRef, CapData<VRef>)> {
        let me = Participant::Device(device);
        let dref = self.map_kernel_slot_to_vat(me, target, MapOptions::DEFAULT)?;
        if !dref.allocated_by_vat {
            return Err(KernelError::corrupt(format!("{} is not exported by {}", target, device)));
        }
        let args = self.map_out(me, methargs)?;
        Ok((dref, args))
    }

    /// Translate device-space capdata into kernel space. Devices cannot
    /// hold promises.
    pub fn translate_device_data(
        &mut self,
        device: crate::types::DeviceId,
        data: &CapData<VRef>,
    ) -> KernelResult<CapData> {
        if let Some(p) = data.slots.iter().find(|s| s.ref_type == RefType::Promise) {
            return Err(KernelError::illegal(format!(
                "devices cannot use promises like {}",
                p
            )));
        }
        self.map_in(Participant::Device(device), data)
    }

    /// Device syscall: send a message with no result.
    pub fn device_send_only(
        &mut self,
        device: crate::types::DeviceId,
        target: VRef,
        methargs: &CapData<VRef>,
    ) -> KernelResult<()> {
        if target.ref_type == RefType::Promise {
            return Err(KernelError::illegal(format!(
                "devices cannot send to promises like {}",
                target
            )));
        }
        let me = Participant::Device(device);
        let ktarget = self.map_vat_slot_to_kernel(me, target, MapOptions::DEFAULT)?;
        let kargs = self.translate_device_data(device, methargs)?;
        self.do_send(ktarget, Message::new(kargs, None))
    }

    // ========================================================================
    // Delivery translation
    // ========================================================================

    /// Translate a message for delivery to `vat`. The result promise's
    /// decider becomes `vat`.
    pub fn translate_message(
        &mut self,
        vat: VatId,
        target: KRef,
        msg: &Message,
    ) -> KernelResult<VatDelivery> {
        let me = Participant::Vat(vat);
        let vtarget = self.map_kernel_slot_to_vat(me, target, MapOptions::DEFAULT)?;
        match target.ref_type() {
            RefType::Object if !vtarget.allocated_by_vat => {
                return Err(KernelError::corrupt(format!("deliver {} to wrong vat {}", target, vat)));
            }
            RefType::Promise => {
                let decider = self.kernel_promise(&target)?.decider;
                if decider != Some(vat) {
                    return Err(KernelError::corrupt(format!(
                        "deliver to {} but decider is {:?}",
                        target, decider
                    )));
                }
            }
            _ => {}
        }
        let methargs = self.map_out(me, &msg.methargs)?;
        let result = match msg.result {
            Some(kpid) => {
                let p = self.kernel_promise(&kpid)?;
                if !p.is_unresolved() {
                    return Err(KernelError::AlreadyResolved(kpid));
                }
                if let Some(decider) = p.decider {
                    return Err(KernelError::corrupt(format!(
                        "result {} already has decider {}",
                        kpid, decider
                    )));
                }
                let vpid = self.map_kernel_slot_to_vat(me, kpid, MapOptions::DEFAULT)?;
                self.set_decider(kpid, Some(vat))?;
                Some(vpid)
            }
            None => None,
        };
        Ok(VatDelivery::Message {
            target: vtarget,
            msg: Message::new(methargs, result),
        })
    }

    /// Translate settled promises for a `notify` delivery.
    pub fn translate_notify(&mut self, vat: VatId, kpids: &[KRef]) -> KernelResult<VatDelivery> {
        let me = Participant::Vat(vat);
        let mut resolutions = Vec::with_capacity(kpids.len());
        for kpid in kpids {
            let p = self.kernel_promise(kpid)?;
            let rejected = p.state == crate::object::PromiseState::Rejected;
            let data = p
                .data
                .clone()
                .ok_or_else(|| KernelError::corrupt(format!("spurious notification {}", kpid)))?;
            let vpid = self.map_kernel_slot_to_vat(me, *kpid, MapOptions::DEFAULT)?;
            let data = self.map_out(me, &data)?;
            resolutions.push(Resolution {
                promise: vpid,
                rejected,
                data,
            });
        }
        Ok(VatDelivery::Notify { resolutions })
    }

    /// Translate a GC action batch, doing its c-list work.
    pub fn translate_gc(&mut self, vat: VatId, kind: GcKind, krefs: &[KRef]) -> KernelResult<VatDelivery> {
        let me = Participant::Vat(vat);
        let mut vrefs = Vec::with_capacity(krefs.len());
        for kref in krefs {
            let vref = self.map_kernel_slot_to_vat(me, *kref, MapOptions::GC)?;
            match kind {
                GcKind::DropExports => self.clear_reachable_flag(me, *kref)?,
                GcKind::RetireExports | GcKind::RetireImports => {
                    self.delete_clist_entry(me, *kref)?
                }
            }
            vrefs.push(vref);
        }
        Ok(match kind {
            GcKind::DropExports => VatDelivery::DropExports { vrefs },
            GcKind::RetireExports => VatDelivery::RetireExports { vrefs },
            GcKind::RetireImports => VatDelivery::RetireImports { vrefs },
        })
    }

    /// Translate `startVat` parameters.
    pub fn translate_start_vat(&mut self, vat: VatId, params: &CapData) -> KernelResult<VatDelivery> {
        let vat_parameters = self.map_out(Participant::Vat(vat), params)?;
        Ok(VatDelivery::StartVat { vat_parameters })
    }
}

fn require_object(vref: &VRef, export: bool, syscall: &str) -> KernelResult<()> {
    vref.expect_type(RefType::Object)?;
    if vref.allocated_by_vat != export {
        let want = if export { "exports" } else { "imports" };
        return Err(KernelError::illegal(format!(
            "{} takes {} only, got {}",
            syscall, want, vref
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{VatOptions, VatRecord};
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

    const A: Participant = Participant::Vat(VatId(1));
    const B: Participant = Participant::Vat(VatId(2));

    #[test]
    fn test_export_allocates_once() {
        let mut state = state_with_vats(1);
        let o1 = VRef::object_export(1);
        let k1 = state.map_vat_slot_to_kernel(A, o1, MapOptions::DEFAULT).unwrap();
        let k2 = state.map_vat_slot_to_kernel(A, o1, MapOptions::DEFAULT).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1, KRef::Object(20));
        // The owner's row does not count
        assert_eq!(state.kernel_object(&k1).unwrap().counts, RefCounts::new(0, 0));
        assert!(state.clist_entry(&A, &k1).unwrap().reachable);
    }

    #[test]
    fn test_unknown_import_is_error() {
        let mut state = state_with_vats(1);
        let err = state
            .map_vat_slot_to_kernel(A, VRef::object_import(77), MapOptions::DEFAULT)
            .unwrap_err();
        assert!(matches!(err, KernelError::UnknownReference { .. }));
    }

    #[test]
    fn test_import_counts_and_is_idempotent() {
        let mut state = state_with_vats(2);
        let ko = state
            .map_vat_slot_to_kernel(A, VRef::object_export(1), MapOptions::DEFAULT)
            .unwrap();

        let v1 = state.map_kernel_slot_to_vat(B, ko, MapOptions::DEFAULT).unwrap();
        let v2 = state.map_kernel_slot_to_vat(B, ko, MapOptions::DEFAULT).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(v1.to_string(), "o-50");
        assert_eq!(state.kernel_object(&ko).unwrap().counts, RefCounts::new(1, 1));
        assert_eq!(state.map_vat_slot_to_kernel(B, v1, MapOptions::DEFAULT).unwrap(), ko);
    }

    #[test]
    fn test_drop_then_use_is_unreachable_import() {
        let mut state = state_with_vats(2);
        let ko = state
            .map_vat_slot_to_kernel(A, VRef::object_export(1), MapOptions::DEFAULT)
            .unwrap();
        let vref = state.map_kernel_slot_to_vat(B, ko, MapOptions::DEFAULT).unwrap();

        state
            .translate_syscall(VatId(2), &VatSyscall::DropImports { vrefs: vec![vref] })
            .unwrap();
        assert_eq!(state.kernel_object(&ko).unwrap().counts, RefCounts::new(0, 1));

        let err = state
            .map_vat_slot_to_kernel(B, vref, MapOptions::DEFAULT)
            .unwrap_err();
        assert!(matches!(err, KernelError::UnreachableImport { .. }));
    }

    #[test]
    fn test_retire_import_requires_drop_first() {
        let mut state = state_with_vats(2);
        let ko = state
            .map_vat_slot_to_kernel(A, VRef::object_export(1), MapOptions::DEFAULT)
            .unwrap();
        let vref = state.map_kernel_slot_to_vat(B, ko, MapOptions::DEFAULT).unwrap();

        let retire = VatSyscall::RetireImports { vrefs: vec![vref] };
        assert!(state.translate_syscall(VatId(2), &retire).is_err());

        state
            .translate_syscall(VatId(2), &VatSyscall::DropImports { vrefs: vec![vref] })
            .unwrap();
        state.translate_syscall(VatId(2), &retire).unwrap();
        assert_eq!(state.kernel_object(&ko).unwrap().counts, RefCounts::new(0, 0));
        assert!(state.clist_entry(&B, &ko).is_none());
    }

    #[test]
    fn test_send_result_must_be_decided_by_sender() {
        let mut state = state_with_vats(2);
        let target = state
            .map_vat_slot_to_kernel(B, VRef::object_export(1), MapOptions::DEFAULT)
            .unwrap();
        let vtarget = state.map_kernel_slot_to_vat(A, target, MapOptions::DEFAULT).unwrap();

        let send = VatSyscall::Send {
            target: vtarget,
            msg: Message::new(CapData::bare("#[]"), Some(VRef::promise_export(5))),
        };
        let ks = state.translate_syscall(VatId(1), &send).unwrap();
        let KernelSyscall::Send { msg, .. } = ks else {
            panic!("expected send");
        };
        let kpid = msg.result.unwrap();
        assert_eq!(state.kernel_promise(&kpid).unwrap().decider, None);

        // Using the same result twice fails: the sender no longer decides it
        assert!(matches!(
            state.translate_syscall(VatId(1), &send),
            Err(KernelError::NotDecider { .. })
        ));
    }

    #[test]
    fn test_message_delivery_sets_decider() {
        let mut state = state_with_vats(2);
        let target = state
            .map_vat_slot_to_kernel(B, VRef::object_export(1), MapOptions::DEFAULT)
            .unwrap();
        let kp = state.add_kernel_promise(None).unwrap();
        let delivery = state
            .translate_message(VatId(2), target, &Message::new(CapData::bare("#[]"), Some(kp)))
            .unwrap();
        assert_eq!(
            delivery,
            VatDelivery::Message {
                target: VRef::object_export(1),
                msg: Message::new(CapData::bare("#[]"), Some(VRef::promise_import(60))),
            }
        );
        assert_eq!(state.kernel_promise(&kp).unwrap().decider, Some(VatId(2)));
    }

    #[test]
    fn test_import_cannot_be_exported_type() {
        let mut state = state_with_vats(1);
        let err = state
            .map_vat_slot_to_kernel(A, VRef::device_export(0), MapOptions::DEFAULT)
            .unwrap_err();
        assert!(matches!(err, KernelError::IllegalSyscall(_)));
    }
}
