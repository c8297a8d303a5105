//! Kernel error types.
//!
//! Errors raised while translating or executing a vat's syscall are fatal
//! to that vat. Errors raised anywhere else mean the kernel's own tables are
//! inconsistent, and the runtime escalates them to a kernel panic.

use alloc::string::String;
use thiserror::Error;

use crate::types::{KRef, VatId};

/// Kernel errors
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum KernelError {
    /// A reference string that does not parse
    #[error("invalid reference '{0}'")]
    InvalidRef(String),
    /// A participant used a local reference that is not in its c-list
    #[error("{participant} used {vref} which is not in its c-list")]
    UnknownReference { participant: String, vref: String },
    /// A participant used an import it had already dropped
    #[error("{participant} used unreachable import {vref}")]
    UnreachableImport { participant: String, vref: String },
    /// A reference of the wrong kind for the operation
    #[error("expected {expected} reference, got {found}")]
    WrongType {
        expected: &'static str,
        found: String,
    },
    /// A kref/kpid absent from the kernel tables
    #[error("unknown kernel reference {0}")]
    UnknownKref(KRef),
    /// Second settlement of a promise
    #[error("{0} was already resolved")]
    AlreadyResolved(KRef),
    /// Settlement by someone other than the decider
    #[error("{kpid} is decided by {actual:?}, not {expected:?}")]
    NotDecider {
        kpid: KRef,
        expected: Option<VatId>,
        actual: Option<VatId>,
    },
    /// Reference count would go below zero
    #[error("refcount underflow on {0}")]
    RefCountUnderflow(KRef),
    /// Unknown vat
    #[error("unknown vat {0}")]
    UnknownVat(String),
    /// Unknown device
    #[error("unknown device {0}")]
    UnknownDevice(String),
    /// The vat was terminated
    #[error("vat {0} is terminated")]
    VatTerminated(VatId),
    /// A syscall that violates the protocol
    #[error("illegal syscall: {0}")]
    IllegalSyscall(String),
    /// Kernel tables are inconsistent
    #[error("kernel state corrupt: {0}")]
    Corrupt(String),
}

impl KernelError {
    /// Shorthand for [`KernelError::IllegalSyscall`].
    pub fn illegal(reason: impl Into<String>) -> Self {
        KernelError::IllegalSyscall(reason.into())
    }

    /// Shorthand for [`KernelError::Corrupt`].
    pub fn corrupt(reason: impl Into<String>) -> Self {
        KernelError::Corrupt(reason.into())
    }
}

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
