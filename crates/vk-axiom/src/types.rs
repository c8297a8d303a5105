//! Common types for the Axiom layer.

/// Event identifier (monotonic, unique within SysLog)
pub type EventId = u64;

/// Commit identifier (32-byte hash)
pub type CommitId = [u8; 32];

/// Crank number (monotonic, one per processed run-queue item)
pub type CrankNum = u64;

/// The all-zero hash used as the genesis predecessor.
pub const ZERO_HASH: CommitId = [0u8; 32];
