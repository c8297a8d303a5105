//! Transcript entries and replay.
//!
//! Every committed delivery to a vat that uses a transcript is stored as one
//! JSON entry: the delivery, each syscall the vat made with the result it
//! got back, and how the delivery ended. After a restart the current span is
//! replayed into a fresh sandbox; syscalls are answered from the recording
//! and never reach the kernel tables.
//!
//! ```text
//! span (incarnation N)
//! ┌───────────────┬───────────────┬─────┐
//! │ startVat      │ message       │ ... │
//! │  syscalls: [] │  syscalls: [  │     │
//! │               │   send → ok,  │     │
//! │               │   get → "x" ] │     │
//! └───────────────┴───────────────┴─────┘
//! ```

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use vk_kernel_core::{VatDelivery, VatSyscall, VatSyscallResult};

use crate::sandbox::{DeliveryStatus, SyscallHandler};

/// One syscall and its answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallRecord {
    pub syscall: VatSyscall,
    pub result: VatSyscallResult,
}

/// One committed delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub delivery: VatDelivery,
    pub syscalls: Vec<SyscallRecord>,
    pub status: DeliveryStatus,
}

impl TranscriptEntry {
    pub fn encode(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("{}", e))
    }

    pub fn decode(item: &str) -> Result<Self, String> {
        serde_json::from_str(item).map_err(|e| format!("{}", e))
    }
}

/// Answers syscalls from a recorded entry, noting the first divergence.
pub(crate) struct ReplayHandler<'a> {
    recorded: &'a [SyscallRecord],
    next: usize,
    mismatch: Option<String>,
}

impl<'a> ReplayHandler<'a> {
    pub(crate) fn new(recorded: &'a [SyscallRecord]) -> Self {
        ReplayHandler {
            recorded,
            next: 0,
            mismatch: None,
        }
    }

    /// The first divergence, including recorded syscalls that were never made.
    pub(crate) fn finish(self) -> Option<String> {
        if self.mismatch.is_some() {
            return self.mismatch;
        }
        if self.next < self.recorded.len() {
            return Some(format!(
                "vat made {} syscalls, transcript has {}",
                self.next,
                self.recorded.len()
            ));
        }
        None
    }
}

impl SyscallHandler for ReplayHandler<'_> {
    fn syscall(&mut self, syscall: &VatSyscall) -> VatSyscallResult {
        if let Some(reason) = &self.mismatch {
            return VatSyscallResult::Error(reason.clone());
        }
        let index = self.next;
        self.next += 1;
        match self.recorded.get(index) {
            Some(record) if record.syscall == *syscall => record.result.clone(),
            Some(record) => {
                let reason = format!(
                    "syscall {} was {}, transcript has {}",
                    index,
                    syscall.name(),
                    record.syscall.name()
                );
                self.mismatch = Some(reason.clone());
                VatSyscallResult::Error(reason)
            }
            None => {
                let reason = format!("extra syscall {} ({})", index, syscall.name());
                self.mismatch = Some(reason.clone());
                VatSyscallResult::Error(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;
    use vk_kernel_core::VRef;

    fn get(key: &str) -> VatSyscall {
        VatSyscall::VatstoreGet {
            key: key.to_string(),
        }
    }

    fn recorded() -> Vec<SyscallRecord> {
        vec![SyscallRecord {
            syscall: get("a"),
            result: VatSyscallResult::Value(Some("1".to_string())),
        }]
    }

    #[test]
    fn test_entry_encoding() {
        let entry = TranscriptEntry {
            delivery: VatDelivery::DropExports {
                vrefs: vec![VRef::object_export(3)],
            },
            syscalls: recorded(),
            status: DeliveryStatus::Ok,
        };
        let item = entry.encode().unwrap();
        assert!(item.contains("\"dropExports\""));
        assert_eq!(TranscriptEntry::decode(&item).unwrap(), entry);
        assert!(TranscriptEntry::decode("{").is_err());
    }

    #[test]
    fn test_replay_answers_from_recording() {
        let records = recorded();
        let mut handler = ReplayHandler::new(&records);
        assert_eq!(
            handler.syscall(&get("a")),
            VatSyscallResult::Value(Some("1".to_string()))
        );
        assert_eq!(handler.finish(), None);
    }

    #[test]
    fn test_replay_detects_divergence() {
        let records = recorded();
        let mut handler = ReplayHandler::new(&records);
        assert!(matches!(handler.syscall(&get("b")), VatSyscallResult::Error(_)));
        assert!(handler.finish().is_some());

        let mut handler = ReplayHandler::new(&records);
        handler.syscall(&get("a"));
        handler.syscall(&get("a"));
        assert!(handler.finish().unwrap().contains("extra syscall 1"));

        let handler = ReplayHandler::new(&records);
        assert!(handler.finish().unwrap().contains("made 0 syscalls"));
    }
}
