//! Vat Kernel Axiom Layer
//!
//! The Axiom layer provides:
//! - **SysLog**: Audit trail of every vat syscall and kernel delivery
//! - **CommitLog**: Crank-aligned state changes, hash chained, for replay
//! - **AxiomGateway**: Entry point that records both
//!
//! # Core Guarantee
//!
//! > Same CommitLog always produces same state.
//!
//! The commit log is generic over the change payload so the kernel core can
//! define its own change vocabulary while the hash chain, trimming and replay
//! driver live here.

#![no_std]
extern crate alloc;

pub mod commitlog;
pub mod gateway;
pub mod replay;
pub mod syslog;
pub mod types;

pub use commitlog::{Commit, CommitLog, CommitPayload, CommitType};
pub use gateway::{AxiomGateway, GatewayState};
pub use replay::{
    apply_commit, replay, replay_and_verify, ReplayError, ReplayResult, Replayable, StateHasher,
};
pub use syslog::{SysEvent, SysEventType, SysLog};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    #[derive(Clone, Debug)]
    struct Note(String);

    impl CommitPayload for Note {
        fn digest(&self, hasher: &mut StateHasher) {
            hasher.write_str(&self.0);
        }
    }

    #[test]
    fn test_axiom_gateway_creation() {
        let gateway: AxiomGateway<Note> = AxiomGateway::new();
        assert_eq!(gateway.syslog().len(), 0);
        assert_eq!(gateway.commitlog().len(), 1); // Genesis commit
    }

    #[test]
    fn test_syslog_records_request_and_response() {
        let mut gateway: AxiomGateway<Note> = AxiomGateway::new();

        let result: Result<u32, &str> =
            gateway.syscall("v1", 0, "send", String::from("ko20"), || Ok(7));

        assert_eq!(result, Ok(7));
        assert_eq!(gateway.syslog().events().len(), 2); // Request + Response
    }

    #[test]
    fn test_commitlog_records_crank() {
        let mut gateway: AxiomGateway<Note> = AxiomGateway::new();

        gateway.commit_crank(
            0,
            alloc::vec![Note(String::from("a")), Note(String::from("b"))],
            [1u8; 32],
        );

        // Genesis + two changes + boundary
        assert_eq!(gateway.commitlog().len(), 4);
        assert_eq!(gateway.commitlog().current_seq(), 3);
        assert!(gateway.verify_integrity());
    }
}
