//! Property tests: random syscall and crank sequences keep the tables sound.
//!
//! Each generated operation runs like a crank: on error the state is restored
//! from a savepoint, on success refcounts are processed and GC actions
//! flushed. The invariants must hold after every step, and replaying the
//! journal must reproduce the live state.

use proptest::prelude::*;
use vk_kernel_core::{
    assert_invariants, check_all_invariants, CapData, KRef, KernelError, KernelResult, KernelState, MapOptions,
    Message, Participant, Plan, Resolution, VRef, VatId, VatOptions, VatSyscall,
};

/// Three vats, each importing the other two roots.
fn three_vats() -> (KernelState, Vec<VatId>) {
    let mut state = KernelState::new();
    let mut vats = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let (vat, _) = state
            .create_vat(name, "bundle", VatOptions::default(), CapData::bare("#{}"))
            .unwrap();
        vats.push(vat);
    }
    for &a in &vats {
        for &b in &vats {
            if a != b {
                let root = state.vat_root(b).unwrap();
                state
                    .map_kernel_slot_to_vat(Participant::Vat(a), root, MapOptions::DEFAULT)
                    .unwrap();
            }
        }
    }
    state.process_refcounts().unwrap();
    state.flush_gc_actions().unwrap();
    (state, vats)
}

#[derive(Clone, Debug)]
enum Op {
    Send {
        from: usize,
        to: usize,
        export: Option<u64>,
        want_result: bool,
    },
    Resolve {
        vat: usize,
        export: Option<u64>,
        rejected: bool,
    },
    DropAll {
        vat: usize,
    },
    Crank,
    Terminate {
        vat: usize,
    },
    /// Owner abandons every export but its root
    Abandon {
        vat: usize,
    },
    /// Owner retires its exports nobody can reach any more
    RetireOwn {
        vat: usize,
    },
    Upgrade {
        vat: usize,
    },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..3usize, 0..3usize, proptest::option::of(1..6u64), any::<bool>()).prop_map(
            |(from, to, export, want_result)| Op::Send {
                from,
                to,
                export,
                want_result,
            }
        ),
        2 => (0..3usize, proptest::option::of(1..6u64), any::<bool>())
            .prop_map(|(vat, export, rejected)| Op::Resolve { vat, export, rejected }),
        2 => (0..3usize).prop_map(|vat| Op::DropAll { vat }),
        4 => Just(Op::Crank),
        1 => (0..3usize).prop_map(|vat| Op::Terminate { vat }),
        1 => (0..3usize).prop_map(|vat| Op::Abandon { vat }),
        2 => (0..3usize).prop_map(|vat| Op::RetireOwn { vat }),
        1 => (0..3usize).prop_map(|vat| Op::Upgrade { vat }),
    ]
}

/// The vat's own non-root object exports that pass `keep`.
fn exports(state: &KernelState, vat: VatId, keep: impl Fn(&KernelState, KRef) -> bool) -> Vec<VRef> {
    state
        .clist(&Participant::Vat(vat))
        .map(|c| {
            c.entries()
                .filter(|(k, e)| k.is_object() && e.vref.allocated_by_vat && !e.vref.is_root())
                .filter(|(k, _)| keep(state, **k))
                .map(|(_, e)| e.vref)
                .collect()
        })
        .unwrap_or_default()
}

/// Run one operation as a crank step. An error means "roll back".
fn apply_op(
    state: &mut KernelState,
    vats: &[VatId],
    op: &Op,
    next_promise: &mut u64,
) -> KernelResult<()> {
    match *op {
        Op::Send {
            from,
            to,
            export,
            want_result,
        } => {
            let (from, to) = (vats[from], vats[to]);
            let me = Participant::Vat(from);
            let root = state
                .vat_root(to)
                .ok_or_else(|| KernelError::UnknownVat(to.to_string()))?;
            let target = if from == to {
                VRef::root()
            } else {
                state
                    .clist_entry(&me, &root)
                    .map(|e| e.vref)
                    .ok_or(KernelError::UnknownKref(root))?
            };
            let slots = export.map(VRef::object_export).into_iter().collect();
            let result = if want_result {
                *next_promise += 1;
                Some(VRef::promise_export(*next_promise))
            } else {
                None
            };
            state.vat_syscall(
                from,
                &VatSyscall::Send {
                    target,
                    msg: Message::new(CapData::new("#[\"poke\",[]]", slots), result),
                },
            )?;
        }
        Op::Resolve {
            vat,
            export,
            rejected,
        } => {
            let vat = vats[vat];
            let Some(kpid) = state.enumerate_promises_by_decider(vat).first().copied() else {
                return Ok(());
            };
            let vpid = state
                .clist_entry(&Participant::Vat(vat), &kpid)
                .map(|e| e.vref)
                .ok_or(KernelError::UnknownKref(kpid))?;
            let slots = export.map(VRef::object_export).into_iter().collect();
            state.vat_syscall(
                vat,
                &VatSyscall::Resolve {
                    resolutions: vec![Resolution {
                        promise: vpid,
                        rejected,
                        data: CapData::new("#\"$0.Alleged: thing\"", slots),
                    }],
                },
            )?;
        }
        Op::DropAll { vat } => {
            let vat = vats[vat];
            let vrefs: Vec<VRef> = state
                .clist(&Participant::Vat(vat))
                .map(|c| {
                    c.entries()
                        .filter(|(k, e)| k.is_object() && !e.vref.allocated_by_vat && e.reachable)
                        .map(|(_, e)| e.vref)
                        .collect()
                })
                .unwrap_or_default();
            if vrefs.is_empty() {
                return Ok(());
            }
            state.vat_syscall(vat, &VatSyscall::DropImports { vrefs: vrefs.clone() })?;
            state.vat_syscall(vat, &VatSyscall::RetireImports { vrefs })?;
        }
        Op::Crank => {
            if let Some(item) = state.pop_run_queue()? {
                if let Plan::Deliver(plan) = state.plan(item)? {
                    state.note_delivery(plan.vat)?;
                }
            }
        }
        Op::Terminate { vat } => {
            state.terminate_vat(vats[vat])?;
        }
        Op::Abandon { vat } => {
            let vat = vats[vat];
            let vrefs = exports(state, vat, |_, _| true);
            if vrefs.is_empty() {
                return Ok(());
            }
            state.vat_syscall(vat, &VatSyscall::AbandonExports { vrefs })?;
        }
        Op::RetireOwn { vat } => {
            let vat = vats[vat];
            let vrefs = exports(state, vat, |s, k| {
                s.object(&k).map(|o| o.counts.reachable == 0).unwrap_or(false)
            });
            if vrefs.is_empty() {
                return Ok(());
            }
            state.vat_syscall(vat, &VatSyscall::RetireExports { vrefs })?;
        }
        Op::Upgrade { vat } => {
            let vat = vats[vat];
            state.begin_upgrade(vat, "bundle-next", "upgraded")?;
            state.mark_running(vat)?;
        }
    }
    state.process_refcounts()?;
    state.flush_gc_actions()
}

proptest! {
    #[test]
    fn prop_invariants_hold_across_cranks(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let (mut state, vats) = three_vats();
        let mut next_promise = 0u64;
        for op in &ops {
            let savepoint = state.clone();
            if apply_op(&mut state, &vats, op, &mut next_promise).is_err() {
                state = savepoint;
            }
            let violations = check_all_invariants(&state);
            prop_assert!(violations.is_empty(), "after {:?}: {:?}", op, violations);
        }
    }

    #[test]
    fn prop_journal_replay_matches_live_state(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let (mut state, vats) = three_vats();
        let mut next_promise = 0u64;
        for op in &ops {
            let savepoint = state.clone();
            if apply_op(&mut state, &vats, op, &mut next_promise).is_err() {
                state = savepoint;
            }
        }
        let mut replayed = KernelState::new();
        for change in state.journal() {
            replayed.apply(change).unwrap();
        }
        prop_assert_eq!(replayed.compute_hash(), state.compute_hash());
        assert_invariants(&replayed);
    }

    #[test]
    fn prop_kv_writes_track_snapshot(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let (mut state, vats) = three_vats();
        let mut store: std::collections::BTreeMap<String, String> =
            KernelState::new().kv_snapshot().unwrap().into_iter().collect();
        let genesis = state.take_journal();
        for (key, value) in state.kv_writes(&genesis).unwrap() {
            match value {
                Some(v) => { store.insert(key, v); }
                None => { store.remove(&key); }
            }
        }
        let mut next_promise = 0u64;
        for op in &ops {
            let savepoint = state.clone();
            if apply_op(&mut state, &vats, op, &mut next_promise).is_err() {
                state = savepoint;
            }
            let journal = state.take_journal();
            for (key, value) in state.kv_writes(&journal).unwrap() {
                match value {
                    Some(v) => { store.insert(key, v); }
                    None => { store.remove(&key); }
                }
            }
        }
        let snapshot: std::collections::BTreeMap<String, String> =
            state.kv_snapshot().unwrap().into_iter().collect();
        prop_assert_eq!(store, snapshot);
    }
}
