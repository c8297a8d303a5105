//! Vat Kernel Core - Deterministic Capability Tables
//!
//! This crate is the **pure** half of the vat kernel: the tables that map
//! each vat's local references onto kernel-wide objects and promises, the
//! reference counts that decide when those can be collected, and the routing
//! rules that decide where a queued message goes. It performs no I/O and
//! never runs vat code.
//!
//! # Design Principles
//!
//! 1. **Deterministic**: same inputs, same state, same hash
//! 2. **Journaled**: every mutation is a [`StateChange`] recorded through
//!    [`KernelState::record`], so a crank can be committed, persisted, or
//!    replayed from the commit log
//! 3. **Rollback by value**: `KernelState` is `Clone`; the runtime keeps a
//!    savepoint and restores it when a crank fails
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      vk-kernel-core                         │
//! │                                                             │
//! │   vat syscall ──translate──▶ kernel syscall ──execute──┐    │
//! │                   (c-list)                             │    │
//! │                                                        ▼    │
//! │   ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐ │
//! │   │   objects   │   │   promises   │   │    run queue     │ │
//! │   │ r/c counts  │   │ decider/queue│   │ send/notify/gc   │ │
//! │   └──────┬──────┘   └──────┬───────┘   └────────┬─────────┘ │
//! │          └───── gc ────────┘          plan ◀────┘           │
//! │             (end of crank)              │                   │
//! │                                         ▼                   │
//! │                               delivery ──translate──▶ vat   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        vk-kernel                            │
//! │   crank loop, vat sandboxes, devices, commit to the stores  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - participant IDs, kref/vref strings, capdata
//! - `object` / `clist` - table rows
//! - `state` - `KernelState`, the `StateChange` journal, hashing
//! - `table` - allocation, refcounts, object and promise lifecycle
//! - `translate` - vref <-> kref translation for syscalls and deliveries
//! - `syscall` / `queue` / `router` - syscall execution, run queue, routing
//! - `gc` - end-of-crank refcount processing and GC action batching
//! - `lifecycle` - vat and device creation, termination, upgrade
//! - `persist` - key/value rows written at commit
//! - `invariants` - runtime-checkable table invariants

#![no_std]
extern crate alloc;

pub mod clist;
pub mod error;
pub mod gc;
pub mod invariants;
pub mod lifecycle;
pub mod object;
pub mod persist;
pub mod queue;
pub mod router;
pub mod state;
pub mod syscall;
pub mod table;
pub mod translate;
pub mod types;

pub use clist::{CList, CListEntry};
pub use error::{KernelError, KernelResult};
pub use invariants::{assert_invariants, check_all_invariants, InvariantViolation};
pub use lifecycle::{DeviceRecord, TerminationReport, VatOptions, VatRecord, VatStatus};
pub use object::{KernelObject, KernelPromise, PromiseState};
pub use queue::{GcAction, GcKind, RunQueueItem};
pub use router::{DeliveryPlan, Plan, Route};
pub use state::{KernelState, StateChange};
pub use syscall::{KernelSyscall, SyscallOutcome, VatDelivery, VatSyscall, VatSyscallResult};
pub use table::RefOptions;
pub use translate::MapOptions;
pub use types::{
    kernel_error, upgrade_disconnection, CapData, DeviceId, KRef, Message, Participant, RefCounts,
    RefType, Resolution, VRef, VRefKind, VatId, DATA_NOT_CALLABLE, VAT_TERMINATED,
};
