//! System Event Log (SysLog)
//!
//! Records every vat syscall (request + response) and every kernel delivery
//! for the audit trail. This is separate from CommitLog - SysLog is for
//! auditing and keeps entries from cranks that were later rolled back,
//! CommitLog is for deterministic replay and only holds committed cranks.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::types::{CrankNum, EventId};

/// A system event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SysEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Participant the event concerns (`v1`, `d7`, or `kernel`)
    pub participant: String,
    /// Crank during which the event happened
    pub crank: CrankNum,
    /// Event type
    pub event_type: SysEventType,
}

/// Type of system event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SysEventType {
    /// Syscall request from a participant
    Request {
        /// Syscall name (`send`, `resolve`, ...)
        syscall: String,
        /// Legible rendering of the translated arguments
        detail: String,
    },
    /// Syscall response to a participant
    Response {
        /// ID of the request this responds to
        request_id: EventId,
        /// Whether the syscall succeeded
        ok: bool,
        /// Error text on failure
        detail: String,
    },
    /// Delivery from the kernel to a participant
    Delivery {
        /// Delivery name (`message`, `notify`, ...)
        delivery: String,
        /// Legible rendering of the delivery
        detail: String,
    },
}

/// Default number of events to keep in memory
pub const MAX_SYSLOG_EVENTS: usize = 10_000;

/// System event log for auditing.
pub struct SysLog {
    /// Event entries (append-only)
    events: Vec<SysEvent>,
    /// Next event ID to assign
    next_id: EventId,
    /// Maximum retained events
    capacity: usize,
}

impl SysLog {
    /// Create a new empty SysLog.
    pub fn new() -> Self {
        Self::with_capacity(MAX_SYSLOG_EVENTS)
    }

    /// Create a SysLog that retains at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, participant: &str, crank: CrankNum, event_type: SysEventType) -> EventId {
        let id = self.next_id;
        self.next_id += 1;

        self.events.push(SysEvent {
            id,
            participant: String::from(participant),
            crank,
            event_type,
        });

        self.trim_if_needed();
        id
    }

    /// Log a syscall request.
    ///
    /// Returns the event ID for correlating with the response.
    pub fn log_request(
        &mut self,
        participant: &str,
        crank: CrankNum,
        syscall: &str,
        detail: String,
    ) -> EventId {
        self.push(
            participant,
            crank,
            SysEventType::Request {
                syscall: String::from(syscall),
                detail,
            },
        )
    }

    /// Log a syscall response.
    pub fn log_response(
        &mut self,
        participant: &str,
        crank: CrankNum,
        request_id: EventId,
        ok: bool,
        detail: String,
    ) {
        self.push(
            participant,
            crank,
            SysEventType::Response {
                request_id,
                ok,
                detail,
            },
        );
    }

    /// Log a kernel delivery.
    pub fn log_delivery(
        &mut self,
        participant: &str,
        crank: CrankNum,
        delivery: &str,
        detail: String,
    ) -> EventId {
        self.push(
            participant,
            crank,
            SysEventType::Delivery {
                delivery: String::from(delivery),
                detail,
            },
        )
    }

    /// Get all events.
    pub fn events(&self) -> &[SysEvent] {
        &self.events
    }

    /// Get events for one participant.
    pub fn events_for<'a>(&'a self, participant: &'a str) -> impl Iterator<Item = &'a SysEvent> {
        self.events
            .iter()
            .filter(move |e| e.participant == participant)
    }

    /// Get the most recent N events.
    pub fn get_recent(&self, count: usize) -> Vec<&SysEvent> {
        self.events.iter().rev().take(count).collect()
    }

    /// Get the number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the next event ID.
    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    /// Trim old events if exceeding capacity.
    fn trim_if_needed(&mut self) {
        if self.events.len() > self.capacity {
            let drain_count = self.events.len() - self.capacity;
            self.events.drain(0..drain_count);
        }
    }
}

impl Default for SysLog {
    fn default() -> Self {
        Self::new()
    }
}
