//! The boundary between the kernel and vat code.
//!
//! The kernel never runs vat code itself. A [`VatSandbox`] receives one
//! delivery at a time and may issue syscalls back through the
//! [`SyscallHandler`] it is handed; the delivery is a blocking call.
//!
//! ```text
//! Kernel ──deliver(VatDelivery)──▶ VatSandbox
//!    ▲                                 │
//!    └──── syscall(VatSyscall) ◀───────┘   (zero or more, synchronously)
//! ```

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use serde::{Deserialize, Serialize};
use vk_kernel_core::{VatDelivery, VatSyscall, VatSyscallResult};

/// How a delivery ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "camelCase")]
pub enum DeliveryStatus {
    Ok,
    /// The vat failed; fatal to the vat
    Error(String),
}

/// Syscall entry point handed to a sandbox for the length of one delivery.
pub trait SyscallHandler {
    /// Issue one syscall.
    ///
    /// After an illegal syscall every later call in the same delivery
    /// returns the same error.
    fn syscall(&mut self, syscall: &VatSyscall) -> VatSyscallResult;
}

/// A running vat incarnation.
pub trait VatSandbox {
    /// Process one delivery.
    fn deliver(&mut self, delivery: &VatDelivery, syscalls: &mut dyn SyscallHandler) -> DeliveryStatus;
}

/// Builds a fresh sandbox for a bundle.
pub type VatFactory = Box<dyn Fn() -> Box<dyn VatSandbox>>;

/// Named vat bundles the kernel can instantiate.
#[derive(Default)]
pub struct BundleRegistry {
    factories: BTreeMap<String, VatFactory>,
}

impl BundleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a bundle.
    pub fn register(&mut self, bundle: &str, factory: VatFactory) {
        self.factories.insert(String::from(bundle), factory);
    }

    pub fn contains(&self, bundle: &str) -> bool {
        self.factories.contains_key(bundle)
    }

    /// A fresh sandbox running `bundle`.
    pub fn instantiate(&self, bundle: &str) -> Option<Box<dyn VatSandbox>> {
        self.factories.get(bundle).map(|factory| factory())
    }
}
