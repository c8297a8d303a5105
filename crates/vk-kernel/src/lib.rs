//! Vat Kernel Runtime
//!
//! This crate drives the pure tables in `vk-kernel-core`: it owns the vat
//! sandboxes and devices, runs cranks, and commits each crank to the commit
//! log, the key/value store and the transcript store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Kernel<K, T>                         │
//! │                                                             │
//! │   host: create_vat / queue_to_kref / upgrade_vat / ...      │
//! │                              │                              │
//! │   step() ──▶ plan ──▶ VatSandbox::deliver ◀──▶ syscalls ────┼──▶ Device
//! │                              │                              │
//! │                         end of crank                        │
//! │          gc ─▶ journal ─▶ AxiomGateway (syslog, commitlog)  │
//! │                        ─▶ KvStore, TranscriptStore          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Failure model
//!
//! - a vat that fails a delivery or makes an illegal syscall is terminated;
//!   the crank's table changes are rolled back first
//! - a failed upgrade leaves the previous incarnation in place
//! - storage failures, corrupt tables and critical-vat terminations are a
//!   [`KernelPanic`]: nothing from that crank is committed and the kernel
//!   refuses further work

#![no_std]
extern crate alloc;

pub mod config;
pub mod crank;
pub mod device;
pub mod error;
pub mod kernel;
pub mod policy;
pub mod sandbox;
mod syscall;
pub mod transcript;

pub use config::KernelConfig;
pub use crank::CrankOutcome;
pub use device::{Device, DeviceSyscalls};
pub use error::{CrankResult, HostError, HostResult, KernelPanic};
pub use kernel::{Kernel, TerminationNotice};
pub use policy::{CrankBudget, Forever, RunPolicy};
pub use sandbox::{BundleRegistry, DeliveryStatus, SyscallHandler, VatFactory, VatSandbox};
pub use transcript::{SyscallRecord, TranscriptEntry};

// Re-export the types hosts and vat implementations need
pub use vk_kernel_core::{
    CapData, DeviceId, KRef, Message, PromiseState, Resolution, VRef, VatDelivery, VatId,
    VatOptions, VatSyscall, VatSyscallResult,
};
pub use vk_store::{MemoryKvStore, MemoryTranscriptStore};
