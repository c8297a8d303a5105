//! Append-only per-vat transcript interface.
//!
//! A transcript is a sequence of items (opaque strings to the store) addressed
//! by a monotonically increasing position. Items are grouped into spans; a new
//! span starts whenever the vat begins a new incarnation, so replay after a
//! restart only needs the current span.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::StoreResult;

/// A contiguous range of transcript positions belonging to one incarnation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSpan {
    /// Incarnation number the span belongs to
    pub incarnation: u64,
    /// First position in the span
    pub start_pos: u64,
    /// One past the last position in the span
    pub end_pos: u64,
}

impl TranscriptSpan {
    /// Number of items in the span.
    pub fn len(&self) -> u64 {
        self.end_pos - self.start_pos
    }

    /// Whether the span has no items.
    pub fn is_empty(&self) -> bool {
        self.start_pos == self.end_pos
    }
}

/// Append-only transcript storage keyed by vat ID.
pub trait TranscriptStore {
    /// Start an empty transcript for a vat (incarnation 0).
    fn init_transcript(&mut self, vat: &str) -> StoreResult<TranscriptSpan>;

    /// Append an item to the vat's current span, returning its position.
    fn append(&mut self, vat: &str, item: String) -> StoreResult<u64>;

    /// The vat's current (open) span.
    fn current_span(&self, vat: &str) -> StoreResult<TranscriptSpan>;

    /// Every span ever recorded for the vat, oldest first.
    fn spans(&self, vat: &str) -> StoreResult<Vec<TranscriptSpan>>;

    /// Read the items of a span.
    fn read_span(&self, vat: &str, span: &TranscriptSpan) -> StoreResult<Vec<String>>;

    /// Close the current span and open a new one for `incarnation`.
    fn rollover(&mut self, vat: &str, incarnation: u64) -> StoreResult<TranscriptSpan>;

    /// Forget the vat's transcript entirely (vat termination).
    fn delete_transcript(&mut self, vat: &str) -> StoreResult<()>;

    /// Whether a transcript exists for the vat.
    fn has_transcript(&self, vat: &str) -> bool;
}
