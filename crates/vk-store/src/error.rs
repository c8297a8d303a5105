//! Error types for the store layer.

use alloc::string::String;
use thiserror::Error;

/// Store failures. The kernel treats every one of these as fatal to the crank
/// that observed it.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend refused or failed the operation
    #[error("store backend failure: {0}")]
    Backend(String),
    /// A transcript operation named a vat with no transcript
    #[error("no transcript for {0}")]
    UnknownTranscript(String),
    /// A position outside the requested span
    #[error("transcript position {pos} outside span {start}..{end}")]
    OutOfSpan { pos: u64, start: u64, end: u64 },
    /// Stored data could not be decoded
    #[error("corrupt store entry at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}
