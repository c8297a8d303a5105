//! Per-participant c-list: a bidirectional kref <-> vref table.
//!
//! ```text
//!   k2v: ko20 -> (o+1, reachable)      v2k: o+1  -> ko20
//!        kp41 -> (p-60, reachable)          p-60 -> kp41
//! ```
//!
//! The table itself knows nothing about refcounts; `translate` keeps the
//! kernel counts in step with every row it adds or removes. Import IDs are
//! allocated here and never reused.

use alloc::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::types::{
    KRef, RefType, VRef, FIRST_IMPORT_DEVICE_ID, FIRST_IMPORT_OBJECT_ID, FIRST_IMPORT_PROMISE_ID,
};

/// The kernel-side half of a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CListEntry {
    pub vref: VRef,
    /// Whether the participant currently holds the reference strongly
    pub reachable: bool,
}

impl CListEntry {
    /// Persisted form: `"R o-50"` or `"_ o-50"`.
    pub fn encode(&self) -> alloc::string::String {
        let flag = if self.reachable { 'R' } else { '_' };
        alloc::format!("{} {}", flag, self.vref)
    }
}

/// One participant's c-list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CList {
    k2v: BTreeMap<KRef, CListEntry>,
    v2k: BTreeMap<VRef, KRef>,
    next_object: u64,
    next_promise: u64,
    next_device: u64,
}

impl CList {
    /// Create an empty c-list.
    pub fn new() -> Self {
        CList {
            k2v: BTreeMap::new(),
            v2k: BTreeMap::new(),
            next_object: FIRST_IMPORT_OBJECT_ID,
            next_promise: FIRST_IMPORT_PROMISE_ID,
            next_device: FIRST_IMPORT_DEVICE_ID,
        }
    }

    /// Look up the row for a kref.
    pub fn get(&self, kref: &KRef) -> Option<&CListEntry> {
        self.k2v.get(kref)
    }

    /// Look up the kref for a vref.
    pub fn kref_for(&self, vref: &VRef) -> Option<KRef> {
        self.v2k.get(vref).copied()
    }

    pub fn contains_kref(&self, kref: &KRef) -> bool {
        self.k2v.contains_key(kref)
    }

    /// The import vref the next `alloc_import` would hand out.
    pub fn peek_import(&self, ref_type: RefType) -> VRef {
        let id = match ref_type {
            RefType::Object => self.next_object,
            RefType::Promise => self.next_promise,
            RefType::Device => self.next_device,
        };
        VRef::plain(ref_type, false, id)
    }

    /// Next import counter for a type (persisted as `<p>.o.nextID` etc.).
    pub fn next_import_id(&self, ref_type: RefType) -> u64 {
        self.peek_import(ref_type).id
    }

    /// Add a row. Import counters move past any import ID inserted, so
    /// replaying rows restores the allocator as well.
    pub fn insert(&mut self, kref: KRef, vref: VRef, reachable: bool) {
        if !vref.allocated_by_vat {
            let next = match vref.ref_type {
                RefType::Object => &mut self.next_object,
                RefType::Promise => &mut self.next_promise,
                RefType::Device => &mut self.next_device,
            };
            if vref.id >= *next {
                *next = vref.id + 1;
            }
        }
        self.k2v.insert(kref, CListEntry { vref, reachable });
        self.v2k.insert(vref, kref);
    }

    /// Remove a row, returning it.
    pub fn remove(&mut self, kref: &KRef) -> Option<CListEntry> {
        let entry = self.k2v.remove(kref)?;
        self.v2k.remove(&entry.vref);
        Some(entry)
    }

    /// Set the reachable flag of an existing row.
    pub fn set_reachable(&mut self, kref: &KRef, reachable: bool) {
        if let Some(entry) = self.k2v.get_mut(kref) {
            entry.reachable = reachable;
        }
    }

    /// All rows in kref order.
    pub fn entries(&self) -> impl Iterator<Item = (&KRef, &CListEntry)> {
        self.k2v.iter()
    }

    /// All rows in vref order (`o+` before `o-` before `p+` ...).
    pub fn by_vref(&self) -> impl Iterator<Item = (&VRef, &KRef)> {
        self.v2k.iter()
    }

    pub fn len(&self) -> usize {
        self.k2v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.k2v.is_empty()
    }

    /// Whether both directions agree row for row.
    pub fn is_consistent(&self) -> bool {
        self.k2v.len() == self.v2k.len()
            && self
                .k2v
                .iter()
                .all(|(k, e)| self.v2k.get(&e.vref) == Some(k))
    }
}

impl Default for CList {
    fn default() -> Self {
        Self::new()
    }
}
