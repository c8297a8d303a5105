//! Commit Log for Deterministic Replay
//!
//! Records kernel state changes as commits, grouped by crank. Each commit links
//! to the previous via hash chain, and every crank ends with a boundary commit
//! carrying the state hash observed after the crank committed.
//!
//! # Core Invariant
//!
//! > `reduce(genesis, commits) -> state`
//!
//! Replaying the same CommitLog always produces the same state, and the state
//! hash at each crank boundary must match the recorded one.

use alloc::vec;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::replay::StateHasher;
use crate::types::{CommitId, CrankNum, EventId, ZERO_HASH};

/// A payload that can be recorded in the commit log.
///
/// The payload only has to feed itself into the chain hash; its meaning is
/// owned by whoever implements [`crate::Replayable`].
pub trait CommitPayload: Clone {
    /// Feed a canonical encoding of the payload into the hasher.
    fn digest(&self, hasher: &mut StateHasher);
}

/// A state mutation record.
///
/// Commits are append-only and form a hash chain for integrity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Commit<C> {
    /// Hash of this commit (computed from contents + prev_commit)
    pub id: CommitId,
    /// Hash of the previous commit (chain integrity)
    pub prev_commit: CommitId,
    /// Sequence number (monotonic)
    pub seq: u64,
    /// Crank that produced this commit
    pub crank: CrankNum,
    /// The type of state mutation
    pub commit_type: CommitType<C>,
    /// Optional: the syslog event that caused this commit
    pub caused_by: Option<EventId>,
}

/// Types of commits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CommitType<C> {
    /// Genesis commit (empty kernel)
    Genesis,
    /// One state change inside a crank
    Change(C),
    /// End of a crank; `state_hash` is the kernel state hash after it
    CrankBoundary {
        crank: CrankNum,
        state_hash: CommitId,
    },
}

/// Default number of commits to keep in memory
pub const MAX_COMMITLOG_ENTRIES: usize = 100_000;

/// Commit log for deterministic replay.
pub struct CommitLog<C> {
    /// Commit entries (append-only)
    commits: Vec<Commit<C>>,
    /// Next sequence number
    next_seq: u64,
    /// Hash of the last commit
    last_hash: CommitId,
    /// Maximum retained entries
    capacity: usize,
}

impl<C: CommitPayload> CommitLog<C> {
    /// Create a new CommitLog with a genesis commit.
    pub fn new() -> Self {
        Self::with_capacity(MAX_COMMITLOG_ENTRIES)
    }

    /// Create a CommitLog that retains at most `capacity` commits.
    pub fn with_capacity(capacity: usize) -> Self {
        let genesis = Commit {
            id: ZERO_HASH,
            prev_commit: ZERO_HASH,
            seq: 0,
            crank: 0,
            commit_type: CommitType::Genesis,
            caused_by: None,
        };
        let id = Self::compute_hash(&genesis);
        let genesis = Commit { id, ..genesis };

        Self {
            commits: vec![genesis],
            next_seq: 1,
            last_hash: id,
            capacity: capacity.max(1),
        }
    }

    /// Append a new commit to the log.
    ///
    /// Returns the commit ID (hash).
    pub fn append(
        &mut self,
        commit_type: CommitType<C>,
        caused_by: Option<EventId>,
        crank: CrankNum,
    ) -> CommitId {
        let commit = Commit {
            id: ZERO_HASH,
            prev_commit: self.last_hash,
            seq: self.next_seq,
            crank,
            commit_type,
            caused_by,
        };
        let id = Self::compute_hash(&commit);
        let commit = Commit { id, ..commit };

        self.last_hash = id;
        self.next_seq += 1;
        self.commits.push(commit);

        self.trim_if_needed();
        id
    }

    /// Compute hash for a commit.
    ///
    /// FNV-1a over the chain link, the header and the payload digest.
    fn compute_hash(commit: &Commit<C>) -> CommitId {
        let mut hasher = StateHasher::new();
        for byte in commit.prev_commit {
            hasher.write_u8(byte);
        }
        hasher.write_u64(commit.seq);
        hasher.write_u64(commit.crank);

        match &commit.commit_type {
            CommitType::Genesis => hasher.write_u8(0),
            CommitType::Change(payload) => {
                hasher.write_u8(1);
                payload.digest(&mut hasher);
            }
            CommitType::CrankBoundary { crank, state_hash } => {
                hasher.write_u8(2);
                hasher.write_u64(*crank);
                for byte in state_hash {
                    hasher.write_u8(*byte);
                }
            }
        }

        hasher.finalize()
    }

    /// Get all retained commits.
    pub fn commits(&self) -> &[Commit<C>] {
        &self.commits
    }

    /// Get commits in a sequence range.
    pub fn get_range(&self, start_seq: u64, end_seq: u64) -> Vec<&Commit<C>> {
        self.commits
            .iter()
            .filter(|c| c.seq >= start_seq && c.seq < end_seq)
            .collect()
    }

    /// Get the most recent N commits.
    pub fn get_recent(&self, count: usize) -> Vec<&Commit<C>> {
        self.commits.iter().rev().take(count).collect()
    }

    /// Get the commits produced by one crank (boundary included).
    pub fn crank_commits(&self, crank: CrankNum) -> Vec<&Commit<C>> {
        self.commits
            .iter()
            .filter(|c| c.crank == crank && !matches!(c.commit_type, CommitType::Genesis))
            .collect()
    }

    /// The most recent crank boundary, if any crank has committed.
    pub fn last_boundary(&self) -> Option<(CrankNum, CommitId)> {
        self.commits.iter().rev().find_map(|c| match c.commit_type {
            CommitType::CrankBoundary { crank, state_hash } => Some((crank, state_hash)),
            _ => None,
        })
    }

    /// Get the head commit ID (hash of the most recent commit).
    pub fn head(&self) -> CommitId {
        self.last_hash
    }

    /// Get the current sequence number (of the last commit).
    pub fn current_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    /// Get the number of retained commits.
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// Check if the log is empty (never true - always has genesis until trimmed).
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Whether the genesis commit is still retained (full replay possible).
    pub fn is_complete(&self) -> bool {
        self.commits
            .first()
            .map(|c| matches!(c.commit_type, CommitType::Genesis))
            .unwrap_or(false)
    }

    /// Verify hash chain integrity.
    ///
    /// After trimming, the chain is verified from the oldest retained commit.
    pub fn verify_integrity(&self) -> bool {
        let Some(first) = self.commits.first() else {
            return true;
        };

        let mut expected_prev = first.prev_commit;
        if first.seq == 0 && expected_prev != ZERO_HASH {
            return false;
        }

        for commit in &self.commits {
            if commit.prev_commit != expected_prev {
                return false;
            }
            if Self::compute_hash(commit) != commit.id {
                return false;
            }
            expected_prev = commit.id;
        }

        expected_prev == self.last_hash
    }

    /// Trim old commits if exceeding capacity.
    fn trim_if_needed(&mut self) {
        if self.commits.len() > self.capacity {
            let drain_count = self.commits.len() - self.capacity;
            self.commits.drain(0..drain_count);
        }
    }
}

impl<C: CommitPayload> Default for CommitLog<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Bump(u64);

    impl CommitPayload for Bump {
        fn digest(&self, hasher: &mut StateHasher) {
            hasher.write_u64(self.0);
        }
    }

    #[test]
    fn test_commitlog_creation() {
        let log: CommitLog<Bump> = CommitLog::new();
        assert_eq!(log.len(), 1); // Genesis
        assert_eq!(log.current_seq(), 0);
        assert!(matches!(log.commits()[0].commit_type, CommitType::Genesis));
        assert!(log.is_complete());
    }

    #[test]
    fn test_commitlog_append() {
        let mut log = CommitLog::new();

        let id1 = log.append(CommitType::Change(Bump(1)), None, 0);
        assert_eq!(log.len(), 2);
        assert_eq!(log.current_seq(), 1);
        assert_ne!(id1, ZERO_HASH);

        let id2 = log.append(CommitType::Change(Bump(2)), None, 0);
        assert_eq!(log.len(), 3);
        assert_ne!(id2, id1);
    }

    #[test]
    fn test_commitlog_integrity() {
        let mut log = CommitLog::new();
        for crank in 0..10 {
            log.append(CommitType::Change(Bump(crank)), None, crank);
            log.append(
                CommitType::CrankBoundary {
                    crank,
                    state_hash: [crank as u8; 32],
                },
                None,
                crank,
            );
        }
        assert!(log.verify_integrity());
        assert_eq!(log.last_boundary(), Some((9, [9u8; 32])));
    }

    #[test]
    fn test_commitlog_detects_tampering() {
        let mut log = CommitLog::new();
        log.append(CommitType::Change(Bump(1)), None, 0);
        log.append(CommitType::Change(Bump(2)), None, 0);

        log.commits[1].commit_type = CommitType::Change(Bump(99));
        assert!(!log.verify_integrity());
    }

    #[test]
    fn test_commitlog_trim_keeps_chain_verifiable() {
        let mut log = CommitLog::with_capacity(4);
        for i in 0..10 {
            log.append(CommitType::Change(Bump(i)), None, i);
        }
        assert_eq!(log.len(), 4);
        assert!(!log.is_complete());
        assert!(log.verify_integrity());
    }

    #[test]
    fn test_commitlog_crank_commits() {
        let mut log = CommitLog::new();
        log.append(CommitType::Change(Bump(1)), None, 0);
        log.append(CommitType::Change(Bump(2)), None, 1);
        log.append(CommitType::Change(Bump(3)), None, 1);

        assert_eq!(log.crank_commits(1).len(), 2);
        assert_eq!(log.get_range(1, 3).len(), 2);
        assert_eq!(log.get_recent(1)[0].seq, 3);
    }

    #[test]
    fn test_commitlog_hash_determinism() {
        let mut log1 = CommitLog::new();
        let mut log2 = CommitLog::new();

        for i in 0..3 {
            let id1 = log1.append(CommitType::Change(Bump(i)), None, i);
            let id2 = log2.append(CommitType::Change(Bump(i)), None, i);
            assert_eq!(id1, id2);
        }

        assert_eq!(log1.head(), log2.head());
    }
}
