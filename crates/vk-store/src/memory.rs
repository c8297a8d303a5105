//! In-memory store implementations.
//!
//! `BTreeMap`-backed, no durability. Used by the kernel's tests and by hosts
//! that run a kernel to completion in one process.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::ops::Bound;

use crate::error::StoreError;
use crate::kv::KvStore;
use crate::transcript::{TranscriptSpan, TranscriptStore};
use crate::StoreResult;

/// In-memory ordered key/value store.
#[derive(Clone, Debug, Default)]
pub struct MemoryKvStore {
    entries: BTreeMap<String, String>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.entries.insert(String::from(key), String::from(value));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn get_next_key(&self, prior_key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .entries
            .range::<str, _>((Bound::Excluded(prior_key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone()))
    }
}

#[derive(Clone, Debug, Default)]
struct VatTranscript {
    items: Vec<String>,
    /// Position of `items[0]`; earlier spans may have been pruned
    base_pos: u64,
    spans: Vec<TranscriptSpan>,
}

/// In-memory transcript store.
#[derive(Clone, Debug, Default)]
pub struct MemoryTranscriptStore {
    transcripts: BTreeMap<String, VatTranscript>,
}

impl MemoryTranscriptStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn transcript(&self, vat: &str) -> StoreResult<&VatTranscript> {
        self.transcripts
            .get(vat)
            .ok_or_else(|| StoreError::UnknownTranscript(String::from(vat)))
    }

    fn transcript_mut(&mut self, vat: &str) -> StoreResult<&mut VatTranscript> {
        self.transcripts
            .get_mut(vat)
            .ok_or_else(|| StoreError::UnknownTranscript(String::from(vat)))
    }
}

impl TranscriptStore for MemoryTranscriptStore {
    fn init_transcript(&mut self, vat: &str) -> StoreResult<TranscriptSpan> {
        let span = TranscriptSpan {
            incarnation: 0,
            start_pos: 0,
            end_pos: 0,
        };
        self.transcripts.insert(
            String::from(vat),
            VatTranscript {
                items: Vec::new(),
                base_pos: 0,
                spans: alloc::vec![span.clone()],
            },
        );
        Ok(span)
    }

    fn append(&mut self, vat: &str, item: String) -> StoreResult<u64> {
        let transcript = self.transcript_mut(vat)?;
        let span = transcript
            .spans
            .last_mut()
            .ok_or_else(|| StoreError::UnknownTranscript(String::from(vat)))?;
        let pos = span.end_pos;
        span.end_pos += 1;
        transcript.items.push(item);
        Ok(pos)
    }

    fn current_span(&self, vat: &str) -> StoreResult<TranscriptSpan> {
        self.transcript(vat)?
            .spans
            .last()
            .cloned()
            .ok_or_else(|| StoreError::UnknownTranscript(String::from(vat)))
    }

    fn spans(&self, vat: &str) -> StoreResult<Vec<TranscriptSpan>> {
        Ok(self.transcript(vat)?.spans.clone())
    }

    fn read_span(&self, vat: &str, span: &TranscriptSpan) -> StoreResult<Vec<String>> {
        let transcript = self.transcript(vat)?;
        let end = transcript.base_pos + transcript.items.len() as u64;
        if span.start_pos < transcript.base_pos || span.end_pos > end {
            return Err(StoreError::OutOfSpan {
                pos: span.start_pos,
                start: transcript.base_pos,
                end,
            });
        }
        let from = (span.start_pos - transcript.base_pos) as usize;
        let to = (span.end_pos - transcript.base_pos) as usize;
        Ok(transcript.items[from..to].to_vec())
    }

    fn rollover(&mut self, vat: &str, incarnation: u64) -> StoreResult<TranscriptSpan> {
        let transcript = self.transcript_mut(vat)?;
        let start_pos = transcript
            .spans
            .last()
            .map(|s| s.end_pos)
            .unwrap_or(transcript.base_pos);
        // Old incarnations are never replayed again; drop their items.
        let keep_from = (start_pos - transcript.base_pos) as usize;
        transcript.items.drain(0..keep_from);
        transcript.base_pos = start_pos;

        let span = TranscriptSpan {
            incarnation,
            start_pos,
            end_pos: start_pos,
        };
        transcript.spans.push(span.clone());
        Ok(span)
    }

    fn delete_transcript(&mut self, vat: &str) -> StoreResult<()> {
        self.transcripts.remove(vat);
        Ok(())
    }

    fn has_transcript(&self, vat: &str) -> bool {
        self.transcripts.contains_key(vat)
    }
}
