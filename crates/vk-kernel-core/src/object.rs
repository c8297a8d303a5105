//! Kernel table rows: objects and promises.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::types::{CapData, Message, RefCounts, VatId};

/// A kernel object (`ko<N>`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelObject {
    /// Exporting vat; `None` once abandoned
    pub owner: Option<VatId>,
    /// Reachable/recognizable counts
    pub counts: RefCounts,
}

/// Settlement state of a kernel promise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseState {
    Unresolved,
    Fulfilled,
    Rejected,
}

impl PromiseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromiseState::Unresolved => "unresolved",
            PromiseState::Fulfilled => "fulfilled",
            PromiseState::Rejected => "rejected",
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, PromiseState::Unresolved)
    }
}

/// A kernel promise (`kp<N>`).
///
/// While unresolved it may have a decider, subscribers and a queue of
/// messages waiting for it to settle. Once settled only `data` and the
/// refcount remain meaningful.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelPromise {
    pub state: PromiseState,
    pub decider: Option<VatId>,
    pub subscribers: BTreeSet<VatId>,
    pub queue: Vec<Message>,
    pub data: Option<CapData>,
    /// c-list rows (imports and exports), queued items, promise data and
    /// external holds referring to this promise
    pub refcount: u32,
}

impl KernelPromise {
    /// A fresh unresolved promise.
    pub fn new(decider: Option<VatId>) -> Self {
        KernelPromise {
            state: PromiseState::Unresolved,
            decider,
            subscribers: BTreeSet::new(),
            queue: Vec::new(),
            data: None,
            refcount: 0,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.state == PromiseState::Unresolved
    }
}
