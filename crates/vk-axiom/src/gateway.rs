//! Axiom Gateway
//!
//! Entry point for all syscalls and crank commits. The gateway:
//! 1. Logs the syscall request to SysLog
//! 2. Executes the kernel operation
//! 3. Logs the syscall response to SysLog
//!
//! and, once a crank is complete, appends the crank's state changes followed
//! by a boundary commit to the CommitLog. Changes from a rolled-back crank are
//! never handed to the gateway, so the CommitLog only ever holds whole cranks.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt::Display;

use crate::commitlog::{CommitLog, CommitPayload, CommitType};
use crate::syslog::SysLog;
use crate::types::{CommitId, CrankNum, EventId};

/// Axiom gateway: SysLog (audit) + CommitLog (replay).
pub struct AxiomGateway<C> {
    /// Syscall audit log
    syslog: SysLog,
    /// State mutation log
    commitlog: CommitLog<C>,
}

impl<C: CommitPayload> AxiomGateway<C> {
    /// Create a new Axiom gateway with default log capacities.
    pub fn new() -> Self {
        Self {
            syslog: SysLog::new(),
            commitlog: CommitLog::new(),
        }
    }

    /// Create a gateway with explicit log capacities.
    pub fn with_capacity(syslog_capacity: usize, commitlog_capacity: usize) -> Self {
        Self {
            syslog: SysLog::with_capacity(syslog_capacity),
            commitlog: CommitLog::with_capacity(commitlog_capacity),
        }
    }

    /// Process a syscall through Axiom.
    ///
    /// # Arguments
    /// - `participant`: vat or device making the syscall
    /// - `crank`: current crank number
    /// - `syscall`: syscall name
    /// - `detail`: legible rendering of the arguments
    /// - `kernel_fn`: the kernel operation
    pub fn syscall<T, E, F>(
        &mut self,
        participant: &str,
        crank: CrankNum,
        syscall: &str,
        detail: String,
        kernel_fn: F,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnOnce() -> Result<T, E>,
    {
        let request_id = self.syslog.log_request(participant, crank, syscall, detail);

        let result = kernel_fn();

        match &result {
            Ok(_) => self
                .syslog
                .log_response(participant, crank, request_id, true, String::new()),
            Err(e) => self
                .syslog
                .log_response(participant, crank, request_id, false, e.to_string()),
        }

        result
    }

    /// Record a delivery to a participant.
    pub fn delivery(
        &mut self,
        participant: &str,
        crank: CrankNum,
        delivery: &str,
        detail: String,
    ) -> EventId {
        self.syslog.log_delivery(participant, crank, delivery, detail)
    }

    /// Append the changes of one committed crank plus its boundary.
    ///
    /// Returns the boundary commit ID.
    pub fn commit_crank(
        &mut self,
        crank: CrankNum,
        changes: Vec<C>,
        state_hash: CommitId,
    ) -> CommitId {
        for change in changes {
            self.commitlog.append(CommitType::Change(change), None, crank);
        }
        self.commitlog
            .append(CommitType::CrankBoundary { crank, state_hash }, None, crank)
    }

    /// Get the SysLog (for inspection/auditing).
    pub fn syslog(&self) -> &SysLog {
        &self.syslog
    }

    /// Get the CommitLog (for replay/inspection).
    pub fn commitlog(&self) -> &CommitLog<C> {
        &self.commitlog
    }

    /// Verify integrity of the commit chain.
    pub fn verify_integrity(&self) -> bool {
        self.commitlog.verify_integrity()
    }

    /// Get current state for monitoring.
    pub fn state_summary(&self) -> GatewayState {
        GatewayState {
            syslog_len: self.syslog.len(),
            syslog_next_id: self.syslog.next_id(),
            commitlog_len: self.commitlog.len(),
            commitlog_seq: self.commitlog.current_seq(),
            commitlog_head: self.commitlog.head(),
        }
    }
}

impl<C: CommitPayload> Default for AxiomGateway<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of gateway state (for debugging/monitoring).
#[derive(Clone, Debug)]
pub struct GatewayState {
    /// Number of events in SysLog
    pub syslog_len: usize,
    /// Next event ID in SysLog
    pub syslog_next_id: u64,
    /// Number of commits in CommitLog
    pub commitlog_len: usize,
    /// Current sequence number in CommitLog
    pub commitlog_seq: u64,
    /// Head commit hash
    pub commitlog_head: CommitId,
}
