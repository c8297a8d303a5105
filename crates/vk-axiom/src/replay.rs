//! Deterministic Replay
//!
//! Replay works by applying commits in sequence to a fresh kernel state:
//!
//! ```text
//! reduce(genesis, commits) -> state
//! ```
//!
//! Each change commit is a pure state mutation with no side effects. Crank
//! boundary commits carry the state hash recorded when the crank committed;
//! replay recomputes the hash at every boundary and stops at the first
//! divergence.

use alloc::string::String;
use serde::Serialize;
use thiserror::Error;

use crate::commitlog::{Commit, CommitType};
use crate::types::{CommitId, CrankNum};

/// Errors that can occur during replay.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ReplayError {
    /// Commit references invalid or missing data
    #[error("invalid commit: {0}")]
    InvalidCommit(String),
    /// Commit log does not start at genesis
    #[error("commit log is incomplete (oldest retained seq {0})")]
    Incomplete(u64),
    /// State hash mismatch after a crank
    #[error("state hash mismatch at crank {crank}")]
    HashMismatch {
        crank: CrankNum,
        expected: CommitId,
        actual: CommitId,
    },
}

/// Result of applying a commit.
pub type ReplayResult<T> = Result<T, ReplayError>;

/// Trait for states that can be rebuilt from a commit log.
pub trait Replayable {
    /// Payload type recorded in the log.
    type Change;

    /// Apply genesis commit (typically a no-op, state starts empty).
    fn replay_genesis(&mut self) -> ReplayResult<()>;

    /// Apply one recorded change.
    ///
    /// Unlike live execution this must not record the change again.
    fn replay_change(&mut self, change: &Self::Change) -> ReplayResult<()>;

    /// Observe the end of a crank.
    fn replay_crank_boundary(&mut self, crank: CrankNum) -> ReplayResult<()>;

    /// Compute a deterministic hash of the current state.
    fn state_hash(&self) -> CommitId;
}

/// Apply a single commit to a replayable state.
pub fn apply_commit<R: Replayable>(state: &mut R, commit: &Commit<R::Change>) -> ReplayResult<()> {
    match &commit.commit_type {
        CommitType::Genesis => state.replay_genesis(),
        CommitType::Change(change) => state.replay_change(change),
        CommitType::CrankBoundary { crank, state_hash } => {
            state.replay_crank_boundary(*crank)?;
            let actual = state.state_hash();
            if actual != *state_hash {
                return Err(ReplayError::HashMismatch {
                    crank: *crank,
                    expected: *state_hash,
                    actual,
                });
            }
            Ok(())
        }
    }
}

/// Replay a sequence of commits to reconstruct state.
///
/// # Example
///
/// ```ignore
/// let mut fresh = KernelState::new();
/// replay(&mut fresh, commitlog.commits())?;
/// assert_eq!(fresh.state_hash(), live.state_hash());
/// ```
pub fn replay<R: Replayable>(state: &mut R, commits: &[Commit<R::Change>]) -> ReplayResult<()> {
    if let Some(first) = commits.first() {
        if !matches!(first.commit_type, CommitType::Genesis) {
            return Err(ReplayError::Incomplete(first.seq));
        }
    }
    for commit in commits {
        apply_commit(state, commit)?;
    }
    Ok(())
}

/// Replay commits and verify the final state hash.
pub fn replay_and_verify<R: Replayable>(
    state: &mut R,
    commits: &[Commit<R::Change>],
    expected_hash: CommitId,
) -> ReplayResult<()> {
    replay(state, commits)?;

    let actual = state.state_hash();
    if actual != expected_hash {
        let crank = commits.last().map(|c| c.crank).unwrap_or(0);
        return Err(ReplayError::HashMismatch {
            crank,
            expected: expected_hash,
            actual,
        });
    }

    Ok(())
}

/// FNV-1a hasher for state hashing.
///
/// This is a simple, deterministic hasher suitable for no_std environments.
/// The hash is expanded to 32 bytes for compatibility with cryptographic hashes.
pub struct StateHasher {
    hash: u64,
}

impl StateHasher {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    /// Create a new hasher.
    pub fn new() -> Self {
        Self {
            hash: Self::FNV_OFFSET,
        }
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, v: u8) {
        self.hash ^= v as u64;
        self.hash = self.hash.wrapping_mul(Self::FNV_PRIME);
    }

    /// Write a u32.
    pub fn write_u32(&mut self, v: u32) {
        for b in v.to_le_bytes() {
            self.write_u8(b);
        }
    }

    /// Write a u64.
    pub fn write_u64(&mut self, v: u64) {
        for b in v.to_le_bytes() {
            self.write_u8(b);
        }
    }

    /// Write a bool.
    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    /// Write a string.
    pub fn write_str(&mut self, s: &str) {
        // Length first for unambiguous hashing
        self.write_u64(s.len() as u64);
        for b in s.bytes() {
            self.write_u8(b);
        }
    }

    /// Write a byte slice.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u64(bytes.len() as u64);
        for b in bytes {
            self.write_u8(*b);
        }
    }

    /// Write the canonical JSON encoding of a value.
    ///
    /// serde_json emits struct fields in declaration order and maps in key
    /// order for `BTreeMap`, so the encoding is stable.
    pub fn write_json<T: Serialize + ?Sized>(&mut self, value: &T) {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.write_bytes(&bytes),
            // Unencodable values still hash to something distinct
            Err(_) => self.write_u8(0xff),
        }
    }

    /// Finalize and return a 32-byte hash.
    ///
    /// The 64-bit FNV hash is expanded to 32 bytes by iteratively
    /// multiplying by the FNV prime.
    pub fn finalize(&self) -> [u8; 32] {
        let mut result = [0u8; 32];
        let mut h = self.hash;

        for chunk in result.chunks_mut(8) {
            let bytes = h.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
            h = h.wrapping_mul(Self::FNV_PRIME);
        }

        result
    }
}

impl Default for StateHasher {
    fn default() -> Self {
        Self::new()
    }
}
