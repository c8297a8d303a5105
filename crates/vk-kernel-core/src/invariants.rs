//! Runtime-checkable kernel invariants
//!
//! These hold at every crank boundary (after `process_refcounts` and
//! `flush_gc_actions`). They back debug assertions in the runtime and the
//! crate's property tests.
//!
//! # Invariants
//!
//! 1. **Refcount Ordering**: recognizable >= reachable for every object
//! 2. **C-List Validity**: every row names a live kref, unless a
//!    `retireImports` for it is still on its way to the importer
//! 3. **C-List Bijection**: forward and reverse rows agree
//! 4. **Importer Counts**: object counts cover the import rows naming it
//! 5. **Promise Counts**: a promise's refcount covers its c-list rows
//! 6. **Owner Rows**: an owned object has a live owner holding its export row
//! 7. **Decider Liveness**: deciders are live vats
//! 8. **Settled Shape**: settled promises have no decider, subscribers or queue
//! 9. **Dead Vats Are Empty**: terminated vats hold no rows and no vatstore
//! 10. **ID Monotonicity**: allocation counters are ahead of every issued ID

use alloc::string::String;
use alloc::vec::Vec;

use crate::queue::{GcKind, RunQueueItem};
use crate::state::KernelState;
use crate::types::{KRef, Participant, RefType, VatId};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_refcount_ordering(state));
    violations.extend(check_clist_validity(state));
    violations.extend(check_clist_bijection(state));
    violations.extend(check_importer_counts(state));
    violations.extend(check_promise_counts(state));
    violations.extend(check_owner_rows(state));
    violations.extend(check_decider_liveness(state));
    violations.extend(check_settled_shape(state));
    violations.extend(check_dead_vats_empty(state));
    violations.extend(check_id_monotonicity(state));

    violations
}

/// Panic with every violation found.
pub fn assert_invariants(state: &KernelState) {
    let violations = check_all_invariants(state);
    if !violations.is_empty() {
        let mut msg = String::from("Kernel invariants violated:\n");
        for v in &violations {
            msg.push_str(&alloc::format!("  [{}] {}\n", v.invariant, v.description));
        }
        panic!("{}", msg);
    }
}

fn violation(invariant: &'static str, description: String) -> InvariantViolation {
    InvariantViolation {
        invariant,
        description,
    }
}

/// Invariant 1: recognizable >= reachable
fn check_refcount_ordering(state: &KernelState) -> Vec<InvariantViolation> {
    state
        .objects
        .iter()
        .filter(|(_, o)| o.counts.recognizable < o.counts.reachable)
        .map(|(kref, o)| {
            violation(
                "refcount_ordering",
                alloc::format!("{} has counts {}", kref, o.counts),
            )
        })
        .collect()
}

/// Whether a `retireImports` for `kref` is pending or queued for `vat`.
fn retire_in_flight(state: &KernelState, vat: VatId, kref: &KRef) -> bool {
    let pending = state
        .pending_gc
        .iter()
        .any(|a| a.vat == vat && a.kind == GcKind::RetireImports && a.kref == *kref);
    pending
        || state.run_queue.iter().any(|item| match item {
            RunQueueItem::Gc {
                vat: v,
                kind: GcKind::RetireImports,
                krefs,
            } => *v == vat && krefs.contains(kref),
            _ => false,
        })
}

/// Invariant 2: every c-list row names a live kref
fn check_clist_validity(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (participant, clist) in &state.clists {
        for (kref, entry) in clist.entries() {
            if state.kref_exists(kref) {
                continue;
            }
            let excused = match participant {
                Participant::Vat(vat) => {
                    kref.is_object()
                        && !entry.vref.allocated_by_vat
                        && retire_in_flight(state, *vat, kref)
                }
                Participant::Device(_) => false,
            };
            if !excused {
                violations.push(violation(
                    "clist_validity",
                    alloc::format!("{} maps {} to missing {}", participant, entry.vref, kref),
                ));
            }
        }
    }

    violations
}

/// Invariant 3: forward and reverse c-list rows agree
fn check_clist_bijection(state: &KernelState) -> Vec<InvariantViolation> {
    state
        .clists
        .iter()
        .filter(|(_, clist)| !clist.is_consistent())
        .map(|(participant, _)| {
            violation(
                "clist_bijection",
                alloc::format!("{} has mismatched forward/reverse rows", participant),
            )
        })
        .collect()
}

/// Invariant 4: object counts cover the import rows naming the object
fn check_importer_counts(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (kref, obj) in &state.objects {
        let mut rows = 0u32;
        let mut reachable_rows = 0u32;
        for clist in state.clists.values() {
            if let Some(entry) = clist.get(kref) {
                if entry.vref.allocated_by_vat {
                    continue;
                }
                rows += 1;
                if entry.reachable {
                    reachable_rows += 1;
                }
            }
        }
        if obj.counts.recognizable < rows || obj.counts.reachable < reachable_rows {
            violations.push(violation(
                "importer_counts",
                alloc::format!(
                    "{} has counts {} but {} import rows ({} reachable)",
                    kref, obj.counts, rows, reachable_rows
                ),
            ));
        }
    }

    violations
}

/// Invariant 5: a promise's refcount covers its c-list rows
fn check_promise_counts(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (kpid, p) in &state.promises {
        let rows = state.clists.values().filter(|c| c.contains_kref(kpid)).count() as u32;
        if p.refcount < rows {
            violations.push(violation(
                "promise_counts",
                alloc::format!("{} has refcount {} but {} c-list rows", kpid, p.refcount, rows),
            ));
        }
    }

    violations
}

/// Invariant 6: an owned object has a live owner holding its export row
fn check_owner_rows(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (kref, obj) in &state.objects {
        let Some(owner) = obj.owner else {
            continue;
        };
        if !state.is_vat_alive(&owner) {
            violations.push(violation(
                "owner_rows",
                alloc::format!("{} is owned by dead vat {}", kref, owner),
            ));
            continue;
        }
        let has_export = state
            .clists
            .get(&Participant::Vat(owner))
            .and_then(|c| c.get(kref))
            .map(|e| e.vref.allocated_by_vat)
            .unwrap_or(false);
        if !has_export {
            violations.push(violation(
                "owner_rows",
                alloc::format!("{} is owned by {} without an export row", kref, owner),
            ));
        }
    }

    violations
}

/// Invariant 7: deciders are live vats
fn check_decider_liveness(state: &KernelState) -> Vec<InvariantViolation> {
    state
        .promises
        .iter()
        .filter_map(|(kpid, p)| match p.decider {
            Some(vat) if !state.is_vat_alive(&vat) => Some(violation(
                "decider_liveness",
                alloc::format!("{} is decided by dead vat {}", kpid, vat),
            )),
            _ => None,
        })
        .collect()
}

/// Invariant 8: settled promises carry only data
fn check_settled_shape(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (kpid, p) in &state.promises {
        if p.is_unresolved() {
            if p.data.is_some() {
                violations.push(violation(
                    "settled_shape",
                    alloc::format!("unresolved {} has resolution data", kpid),
                ));
            }
            continue;
        }
        if p.decider.is_some() || !p.subscribers.is_empty() || !p.queue.is_empty() {
            violations.push(violation(
                "settled_shape",
                alloc::format!(
                    "{} {} still has a decider, subscribers or queued messages",
                    p.state.as_str(),
                    kpid
                ),
            ));
        }
        if p.data.is_none() {
            violations.push(violation(
                "settled_shape",
                alloc::format!("{} {} has no data", p.state.as_str(), kpid),
            ));
        }
    }

    violations
}

/// Invariant 9: terminated vats hold nothing
fn check_dead_vats_empty(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for vat in state.vats.keys() {
        if state.is_vat_alive(vat) {
            continue;
        }
        let rows = state
            .clists
            .get(&Participant::Vat(*vat))
            .map(|c| c.len())
            .unwrap_or(0);
        if rows > 0 {
            violations.push(violation(
                "dead_vats_empty",
                alloc::format!("terminated {} still has {} c-list rows", vat, rows),
            ));
        }
        if state.vatstore_len(vat) > 0 {
            violations.push(violation(
                "dead_vats_empty",
                alloc::format!("terminated {} still has vatstore entries", vat),
            ));
        }
    }

    violations
}

/// Invariant 10: counters are ahead of every issued ID
fn check_id_monotonicity(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    if let Some(vat) = state.vats.keys().next_back() {
        if vat.0 >= state.next_vat_id {
            violations.push(violation(
                "id_monotonicity",
                alloc::format!("{} exists but next vat ID is {}", vat, state.next_vat_id),
            ));
        }
    }
    if let Some(device) = state.devices.keys().next_back() {
        if device.0 >= state.next_device_id {
            violations.push(violation(
                "id_monotonicity",
                alloc::format!("{} exists but next device ID is {}", device, state.next_device_id),
            ));
        }
    }

    let kernel_tables = [
        (state.objects.keys().next_back(), state.next_object_id),
        (state.promises.keys().next_back(), state.next_promise_id),
        (state.device_nodes.keys().next_back(), state.next_devnode_id),
    ];
    for (last, next) in kernel_tables {
        if let Some(kref) = last {
            if kref.id() >= next {
                violations.push(violation(
                    "id_monotonicity",
                    alloc::format!("{} exists but next ID is {}", kref, next),
                ));
            }
        }
    }

    for (participant, clist) in &state.clists {
        for (_, entry) in clist.entries() {
            if entry.vref.allocated_by_vat {
                continue;
            }
            let next = clist.next_import_id(entry.vref.ref_type);
            if entry.vref.id >= next {
                violations.push(violation(
                    "id_monotonicity",
                    alloc::format!(
                        "{} imports {} but next {} import ID is {}",
                        participant,
                        entry.vref,
                        entry.vref.ref_type.name(),
                        next
                    ),
                ));
            }
        }
    }

    // Pins and host holds must name live rows
    for kref in &state.pinned {
        if !state.kref_exists(kref) {
            violations.push(violation(
                "id_monotonicity",
                alloc::format!("pinned {} does not exist", kref),
            ));
        }
    }
    for kpid in &state.kernel_held {
        if kpid.ref_type() != RefType::Promise || !state.kref_exists(kpid) {
            violations.push(violation(
                "id_monotonicity",
                alloc::format!("held {} is not a live promise", kpid),
            ));
        }
    }

    violations
}
