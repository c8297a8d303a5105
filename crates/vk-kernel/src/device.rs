//! Devices: host-provided participants reached synchronously via `callNow`.
//!
//! A device exports device nodes (`d+N`) and may import objects, but never
//! promises. Its imports are never dropped. The only syscall it has is
//! `sendOnly`, which queues a message with no result.

use alloc::string::{String, ToString};
use vk_kernel_core::{CapData, DeviceId, KernelState, VRef};

/// Syscalls available to a device while it handles an `invoke`.
pub trait DeviceSyscalls {
    /// Queue a message to an object the device imported.
    fn send_only(&mut self, target: VRef, methargs: CapData<VRef>) -> Result<(), String>;
}

/// A device implementation.
pub trait Device {
    /// Handle `callNow(target, methargs)` from a vat.
    ///
    /// An `Err` is handed back to the calling vat as the syscall result and
    /// does not harm it.
    fn invoke(
        &mut self,
        target: VRef,
        methargs: &CapData<VRef>,
        syscalls: &mut dyn DeviceSyscalls,
    ) -> Result<CapData<VRef>, String>;
}

/// Device syscalls bound to the kernel tables.
pub(crate) struct DeviceContext<'a> {
    pub(crate) state: &'a mut KernelState,
    pub(crate) device: DeviceId,
}

impl DeviceSyscalls for DeviceContext<'_> {
    fn send_only(&mut self, target: VRef, methargs: CapData<VRef>) -> Result<(), String> {
        self.state
            .device_send_only(self.device, target, &methargs)
            .map_err(|e| e.to_string())
    }
}
