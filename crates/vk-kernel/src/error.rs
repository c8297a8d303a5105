//! Runtime errors.
//!
//! A [`KernelPanic`] stops the kernel: the crank that raised it is never
//! committed and every later call fails with [`KernelPanic::Halted`]. A
//! [`HostError`] only rejects one host request.

use alloc::string::String;
use thiserror::Error;
use vk_kernel_core::{KernelError, VatId};
use vk_store::StoreError;

/// Fatal kernel failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum KernelPanic {
    /// Kernel-side bookkeeping failed outside any vat's syscalls
    #[error("kernel tables corrupt: {0}")]
    Corrupt(#[from] KernelError),
    /// The KV or transcript store failed during commit
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
    /// A vat marked critical was terminated
    #[error("critical vat {0} terminated")]
    CriticalVat(VatId),
    /// A live vat has no running sandbox
    #[error("no sandbox for live vat {0}")]
    MissingSandbox(VatId),
    /// Post-crank invariant check failed
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// An earlier panic stopped the kernel
    #[error("kernel halted after panic: {0}")]
    Halted(String),
}

/// A host request the kernel refused.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HostError {
    /// The request named unknown or unusable references
    #[error("rejected: {0}")]
    Rejected(#[from] KernelError),
    /// No factory is registered under the bundle name
    #[error("unknown bundle '{0}'")]
    UnknownBundle(String),
    /// Configuration JSON did not parse
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Transcript replay diverged from the recording
    #[error("transcript mismatch for {vat} at position {pos}: {detail}")]
    TranscriptMismatch { vat: VatId, pos: u64, detail: String },
    /// The kernel panicked while handling the request
    #[error(transparent)]
    Panic(#[from] KernelPanic),
}

impl From<StoreError> for HostError {
    fn from(e: StoreError) -> Self {
        HostError::Panic(KernelPanic::Store(e))
    }
}

/// Result type for crank execution.
pub type CrankResult<T> = Result<T, KernelPanic>;

/// Result type for host requests.
pub type HostResult<T> = Result<T, HostError>;
