//! Live syscall handling for one delivery.
//!
//! Every syscall goes through the axiom gateway, so the syslog holds a
//! request and a response event for each one, and is then translated and
//! executed against the kernel tables. `callNow` continues into the device
//! synchronously.
//!
//! The first illegal syscall poisons the rest of the delivery: the crank is
//! rolled back and the vat terminated once the sandbox returns.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use serde::Serialize;
use vk_axiom::{AxiomGateway, CrankNum};
use vk_kernel_core::{
    CapData, DeviceId, KRef, KernelResult, KernelState, StateChange, SyscallOutcome, VatId,
    VatSyscall, VatSyscallResult,
};

use crate::device::{Device, DeviceContext};
use crate::sandbox::SyscallHandler;
use crate::transcript::SyscallRecord;

/// JSON detail for a syslog event. A value that cannot be encoded is
/// logged with an empty detail and a warning.
pub(crate) fn log_detail<T: Serialize + ?Sized>(value: &T, what: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        tracing::warn!(target: "vk_kernel::syslog", what, error = %e, "cannot encode syslog detail");
        String::new()
    })
}

/// What a delivery's syscalls left behind.
pub(crate) struct SyscallSummary {
    /// Reason the vat must be terminated
    pub(crate) fatal: Option<String>,
    /// `exit(failure, info)` requested by the vat
    pub(crate) exit: Option<(bool, CapData)>,
    pub(crate) records: Vec<SyscallRecord>,
}

pub(crate) struct SyscallContext<'a> {
    state: &'a mut KernelState,
    gateway: &'a mut AxiomGateway<StateChange>,
    devices: &'a mut BTreeMap<DeviceId, Box<dyn Device>>,
    vat: VatId,
    crank: CrankNum,
    fatal: Option<String>,
    exit: Option<(bool, CapData)>,
    records: Vec<SyscallRecord>,
}

impl<'a> SyscallContext<'a> {
    pub(crate) fn new(
        state: &'a mut KernelState,
        gateway: &'a mut AxiomGateway<StateChange>,
        devices: &'a mut BTreeMap<DeviceId, Box<dyn Device>>,
        vat: VatId,
        crank: CrankNum,
    ) -> Self {
        SyscallContext {
            state,
            gateway,
            devices,
            vat,
            crank,
            fatal: None,
            exit: None,
            records: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> SyscallSummary {
        SyscallSummary {
            fatal: self.fatal,
            exit: self.exit,
            records: self.records,
        }
    }

    fn execute(&mut self, syscall: &VatSyscall) -> KernelResult<VatSyscallResult> {
        let participant = self.vat.to_string();
        let detail = log_detail(syscall, syscall.name());
        let state = &mut *self.state;
        let vat = self.vat;
        let outcome = self
            .gateway
            .syscall(&participant, self.crank, syscall.name(), detail, || {
                state.vat_syscall(vat, syscall)
            })?;
        match outcome {
            SyscallOutcome::Ok => Ok(VatSyscallResult::Ok),
            SyscallOutcome::Value(value) => Ok(VatSyscallResult::Value(value)),
            SyscallOutcome::Exit { failure, info } => {
                if self.exit.is_none() {
                    self.exit = Some((failure, info));
                }
                Ok(VatSyscallResult::Ok)
            }
            SyscallOutcome::Invoke {
                device,
                target,
                methargs,
            } => self.invoke(device, target, &methargs),
        }
    }

    /// `callNow`: hand the call to the device and translate its answer.
    ///
    /// A device error is returned to the vat. An answer that cannot be
    /// translated fails the delivery.
    fn invoke(&mut self, device: DeviceId, target: KRef, methargs: &CapData) -> KernelResult<VatSyscallResult> {
        let (dref, args) = self.state.translate_device_args(device, target, methargs)?;
        let participant = device.to_string();
        let detail = log_detail(&args, "invoke");
        self.gateway.delivery(&participant, self.crank, "invoke", detail);

        let Some(handler) = self.devices.get_mut(&device) else {
            return Ok(VatSyscallResult::Error(format!("device {} is not attached", device)));
        };
        let mut ctx = DeviceContext {
            state: &mut *self.state,
            device,
        };
        match handler.invoke(dref, &args, &mut ctx) {
            Ok(result) => {
                let data = self.state.translate_invoke_result(device, self.vat, &result)?;
                Ok(VatSyscallResult::Data(data))
            }
            Err(reason) => {
                tracing::debug!(target: "vk_kernel::device", %device, %reason, "invoke failed");
                Ok(VatSyscallResult::Error(reason))
            }
        }
    }
}

impl SyscallHandler for SyscallContext<'_> {
    fn syscall(&mut self, syscall: &VatSyscall) -> VatSyscallResult {
        if let Some(reason) = &self.fatal {
            return VatSyscallResult::Error(reason.clone());
        }
        match self.execute(syscall) {
            Ok(result) => {
                self.records.push(SyscallRecord {
                    syscall: syscall.clone(),
                    result: result.clone(),
                });
                result
            }
            Err(e) => {
                let reason = format!("syscall {} failed: {}", syscall.name(), e);
                tracing::warn!(target: "vk_kernel::syscall", vat = %self.vat, crank = self.crank, %reason, "illegal syscall");
                self.fatal = Some(reason.clone());
                VatSyscallResult::Error(reason)
            }
        }
    }
}
