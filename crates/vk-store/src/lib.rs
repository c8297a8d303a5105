//! Vat Kernel Store Interface
//!
//! The kernel consumes two storage services and specifies nothing else about
//! the engine behind them:
//!
//! - **KvStore**: ordered key/value storage (`get`, `set`, `delete`,
//!   `get_next_key`) holding the kernel tables and each vat's vatstore
//! - **TranscriptStore**: an append-only log per vat, split into spans (one per
//!   incarnation), read back to replay a vat after a restart
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     vk-kernel                        │
//! │     crank commit ──▶ KV writes + transcript items    │
//! └───────────────┬───────────────────────┬──────────────┘
//!                 ▼                       ▼
//!        ┌─────────────────┐    ┌────────────────────┐
//!        │    KvStore      │    │  TranscriptStore   │
//!        │  ordered keys   │    │  v1: [span0|span1] │
//!        └─────────────────┘    └────────────────────┘
//! ```
//!
//! Writes reach the store only when a crank commits, so the store never sees
//! a partial crank. `memory` provides in-memory implementations used by tests
//! and by hosts that do not need durability.

#![no_std]
extern crate alloc;

pub mod error;
pub mod kv;
pub mod memory;
pub mod transcript;

pub use error::StoreError;
pub use kv::{KvStore, KvWrite};
pub use memory::{MemoryKvStore, MemoryTranscriptStore};
pub use transcript::{TranscriptSpan, TranscriptStore};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
