//! The vat-facing protocol: syscalls in, deliveries out.
//!
//! A syscall arrives in the vat's own reference space ([`VatSyscall`]), is
//! translated through the vat's c-list into a [`KernelSyscall`], and then
//! executed against the kernel tables:
//!
//! ```text
//!   VatSyscall ──translate_syscall──▶ KernelSyscall ──execute_syscall──▶ SyscallOutcome
//!     (vrefs)        (c-list)            (krefs)          (tables)
//! ```
//!
//! Any error on this path is fatal to the calling vat.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::state::{KernelState, StateChange};
use crate::types::{CapData, DeviceId, KRef, Message, Resolution, VRef, VatId};

// ============================================================================
// Vat-space protocol
// ============================================================================

/// A syscall as the vat issued it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatSyscall {
    Send {
        target: VRef,
        msg: Message<VRef>,
    },
    Subscribe {
        vpid: VRef,
    },
    Resolve {
        resolutions: Vec<Resolution<VRef>>,
    },
    Exit {
        failure: bool,
        info: CapData<VRef>,
    },
    DropImports {
        vrefs: Vec<VRef>,
    },
    RetireImports {
        vrefs: Vec<VRef>,
    },
    RetireExports {
        vrefs: Vec<VRef>,
    },
    AbandonExports {
        vrefs: Vec<VRef>,
    },
    CallNow {
        target: VRef,
        methargs: CapData<VRef>,
    },
    VatstoreGet {
        key: String,
    },
    VatstoreSet {
        key: String,
        value: String,
    },
    VatstoreDelete {
        key: String,
    },
    VatstoreGetNextKey {
        prior: String,
    },
}

impl VatSyscall {
    /// Syscall name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            VatSyscall::Send { .. } => "send",
            VatSyscall::Subscribe { .. } => "subscribe",
            VatSyscall::Resolve { .. } => "resolve",
            VatSyscall::Exit { .. } => "exit",
            VatSyscall::DropImports { .. } => "dropImports",
            VatSyscall::RetireImports { .. } => "retireImports",
            VatSyscall::RetireExports { .. } => "retireExports",
            VatSyscall::AbandonExports { .. } => "abandonExports",
            VatSyscall::CallNow { .. } => "callNow",
            VatSyscall::VatstoreGet { .. } => "vatstoreGet",
            VatSyscall::VatstoreSet { .. } => "vatstoreSet",
            VatSyscall::VatstoreDelete { .. } => "vatstoreDelete",
            VatSyscall::VatstoreGetNextKey { .. } => "vatstoreGetNextKey",
        }
    }
}

/// What a syscall returns to the vat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "camelCase")]
pub enum VatSyscallResult {
    Ok,
    /// vatstore reads
    Value(Option<String>),
    /// callNow results
    Data(CapData<VRef>),
    /// A device reported an error; not fatal to the vat
    Error(String),
}

/// A delivery in the receiving vat's reference space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatDelivery {
    Message {
        target: VRef,
        msg: Message<VRef>,
    },
    Notify {
        resolutions: Vec<Resolution<VRef>>,
    },
    DropExports {
        vrefs: Vec<VRef>,
    },
    RetireExports {
        vrefs: Vec<VRef>,
    },
    RetireImports {
        vrefs: Vec<VRef>,
    },
    #[serde(rename_all = "camelCase")]
    StartVat {
        vat_parameters: CapData<VRef>,
    },
    BringOutYourDead,
}

impl VatDelivery {
    /// Delivery name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            VatDelivery::Message { .. } => "message",
            VatDelivery::Notify { .. } => "notify",
            VatDelivery::DropExports { .. } => "dropExports",
            VatDelivery::RetireExports { .. } => "retireExports",
            VatDelivery::RetireImports { .. } => "retireImports",
            VatDelivery::StartVat { .. } => "startVat",
            VatDelivery::BringOutYourDead => "bringOutYourDead",
        }
    }
}

// ============================================================================
// Kernel-space protocol
// ============================================================================

/// A translated syscall. GC syscalls that finish their work during
/// translation carry only the krefs, for logging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelSyscall {
    Send { target: KRef, msg: Message },
    Subscribe { vat: VatId, kpid: KRef },
    Resolve { vat: VatId, resolutions: Vec<Resolution> },
    Exit { vat: VatId, failure: bool, info: CapData },
    DropImports { krefs: Vec<KRef> },
    RetireImports { krefs: Vec<KRef> },
    RetireExports { krefs: Vec<KRef> },
    AbandonExports { vat: VatId, krefs: Vec<KRef> },
    Invoke { device: DeviceId, target: KRef, methargs: CapData },
    VatstoreGet { vat: VatId, key: String },
    VatstoreSet { vat: VatId, key: String, value: String },
    VatstoreDelete { vat: VatId, key: String },
    VatstoreGetNextKey { vat: VatId, prior: String },
}

/// Result of executing a kernel syscall.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyscallOutcome {
    Ok,
    Value(Option<String>),
    /// The vat asked to be terminated; handled at crank end
    Exit { failure: bool, info: CapData },
    /// The runtime must call into a device synchronously
    Invoke {
        device: DeviceId,
        target: KRef,
        methargs: CapData,
    },
}

impl KernelState {
    /// Execute a translated syscall.
    pub fn execute_syscall(&mut self, ks: KernelSyscall) -> KernelResult<SyscallOutcome> {
        match ks {
            KernelSyscall::Send { target, msg } => {
                self.do_send(target, msg)?;
                Ok(SyscallOutcome::Ok)
            }
            KernelSyscall::Subscribe { vat, kpid } => {
                self.do_subscribe(vat, kpid)?;
                Ok(SyscallOutcome::Ok)
            }
            KernelSyscall::Resolve { vat, resolutions } => {
                self.do_resolve(Some(vat), resolutions)?;
                Ok(SyscallOutcome::Ok)
            }
            KernelSyscall::Exit { failure, info, .. } => Ok(SyscallOutcome::Exit { failure, info }),
            KernelSyscall::DropImports { .. } | KernelSyscall::RetireImports { .. } => {
                Ok(SyscallOutcome::Ok)
            }
            KernelSyscall::RetireExports { krefs } => {
                let live: Vec<KRef> = krefs
                    .into_iter()
                    .filter(|k| self.objects.contains_key(k))
                    .collect();
                self.retire_kernel_objects(&live)?;
                Ok(SyscallOutcome::Ok)
            }
            KernelSyscall::AbandonExports { vat, krefs } => {
                for kref in krefs {
                    self.orphan_kernel_object(kref, vat)?;
                }
                Ok(SyscallOutcome::Ok)
            }
            KernelSyscall::Invoke {
                device,
                target,
                methargs,
            } => Ok(SyscallOutcome::Invoke {
                device,
                target,
                methargs,
            }),
            KernelSyscall::VatstoreGet { vat, key } => {
                Ok(SyscallOutcome::Value(self.vatstore_get(&vat, &key).cloned()))
            }
            KernelSyscall::VatstoreSet { vat, key, value } => {
                self.record(StateChange::VatstoreSet { vat, key, value })?;
                Ok(SyscallOutcome::Ok)
            }
            KernelSyscall::VatstoreDelete { vat, key } => {
                if self.vatstore_get(&vat, &key).is_some() {
                    self.record(StateChange::VatstoreDeleted { vat, key })?;
                }
                Ok(SyscallOutcome::Ok)
            }
            KernelSyscall::VatstoreGetNextKey { vat, prior } => {
                let next = self.vatstore.get(&vat).and_then(|store| {
                    store
                        .range::<str, _>((
                            core::ops::Bound::Excluded(prior.as_str()),
                            core::ops::Bound::Unbounded,
                        ))
                        .next()
                        .map(|(k, _)| k.clone())
                });
                Ok(SyscallOutcome::Value(next))
            }
        }
    }

    /// Translate and execute one vat syscall.
    pub fn vat_syscall(&mut self, vat: VatId, vsc: &VatSyscall) -> KernelResult<SyscallOutcome> {
        if !self.is_vat_alive(&vat) {
            return Err(KernelError::VatTerminated(vat));
        }
        let ks = self.translate_syscall(vat, vsc)?;
        self.execute_syscall(ks)
    }
}

/// Keys are opaque but must be non-empty.
pub(crate) fn check_vatstore_key(key: &str) -> KernelResult<()> {
    if key.is_empty() {
        return Err(KernelError::illegal(format!("invalid vatstore key '{}'", key)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{VatOptions, VatRecord};
    use alloc::string::ToString;

    fn state_with_vat() -> KernelState {
        let mut state = KernelState::new();
        state
            .record(StateChange::VatCreated {
                vat: VatId(1),
                record: VatRecord::new("v", "b", VatOptions::default()),
            })
            .unwrap();
        state
    }

    fn run(state: &mut KernelState, vsc: VatSyscall) -> SyscallOutcome {
        state.vat_syscall(VatId(1), &vsc).unwrap()
    }

    #[test]
    fn test_vatstore_syscalls() {
        let mut state = state_with_vat();
        for key in ["b", "a", "c"] {
            run(
                &mut state,
                VatSyscall::VatstoreSet {
                    key: key.to_string(),
                    value: key.to_uppercase(),
                },
            );
        }
        assert_eq!(
            run(&mut state, VatSyscall::VatstoreGet { key: "b".to_string() }),
            SyscallOutcome::Value(Some("B".to_string()))
        );
        assert_eq!(
            run(
                &mut state,
                VatSyscall::VatstoreGetNextKey {
                    prior: "a".to_string()
                }
            ),
            SyscallOutcome::Value(Some("b".to_string()))
        );
        run(&mut state, VatSyscall::VatstoreDelete { key: "b".to_string() });
        assert_eq!(
            run(
                &mut state,
                VatSyscall::VatstoreGetNextKey {
                    prior: "a".to_string()
                }
            ),
            SyscallOutcome::Value(Some("c".to_string()))
        );
        assert_eq!(
            run(
                &mut state,
                VatSyscall::VatstoreGetNextKey {
                    prior: "c".to_string()
                }
            ),
            SyscallOutcome::Value(None)
        );
    }

    #[test]
    fn test_empty_vatstore_key_is_illegal() {
        let mut state = state_with_vat();
        let err = state
            .vat_syscall(
                VatId(1),
                &VatSyscall::VatstoreSet {
                    key: String::new(),
                    value: "x".to_string(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, KernelError::IllegalSyscall(_)));
    }

    #[test]
    fn test_exit_is_reported() {
        let mut state = state_with_vat();
        let outcome = run(
            &mut state,
            VatSyscall::Exit {
                failure: true,
                info: CapData::bare("#\"bye\""),
            },
        );
        assert_eq!(
            outcome,
            SyscallOutcome::Exit {
                failure: true,
                info: CapData::bare("#\"bye\"")
            }
        );
    }

    #[test]
    fn test_syscall_json_shape() {
        let vsc = VatSyscall::Send {
            target: VRef::object_import(50),
            msg: Message::new(CapData::bare("#[]"), Some(VRef::promise_export(1))),
        };
        let json = serde_json::to_string(&vsc).unwrap();
        assert_eq!(
            json,
            r##"{"type":"send","target":"o-50","msg":{"methargs":{"body":"#[]","slots":[]},"result":"p+1"}}"##
        );
    }
}
