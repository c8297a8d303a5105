//! Run-queue routing: what a popped item turns into.
//!
//! `plan` consumes one run-queue item, does all of its kernel-side work
//! (refcount release, splats, requeues, delivery translation) and tells the
//! runtime what, if anything, must be handed to a vat.
//!
//! Routing of `send`:
//!
//! ```text
//!   target ko     ── owner live ──────────────▶ deliver to owner
//!                 └─ otherwise ───────────────▶ splat "vat terminated"
//!   target kp     ── fulfilled to one ko ─────▶ route to that ko
//!                 ├─ fulfilled otherwise ─────▶ splat "data is not callable"
//!                 ├─ rejected ────────────────▶ splat with rejection
//!                 ├─ no decider ──────────────▶ queue on promise
//!                 ├─ decider terminated ──────▶ splat "vat terminated"
//!                 ├─ decider pipelines ───────▶ deliver to decider
//!                 └─ otherwise ───────────────▶ queue on promise
//! ```

use alloc::format;
use alloc::string::String;

use crate::error::{KernelError, KernelResult};
use crate::object::PromiseState;
use crate::queue::RunQueueItem;
use crate::state::KernelState;
use crate::syscall::VatDelivery;
use crate::table::RefOptions;
use crate::types::{
    kernel_error, CapData, KRef, Message, Participant, VatId, DATA_NOT_CALLABLE, VAT_TERMINATED,
};

/// Where a `send` goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Deliver to `vat`, addressed to `target` (may differ from the
    /// queued target when a promise was fulfilled to an object)
    Deliver { vat: VatId, target: KRef },
    /// Park on the promise until it settles or gains a pipelining decider
    Requeue,
    /// Reject the result promise, if any
    Splat { error: CapData },
}

/// One delivery the runtime must make.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryPlan {
    pub vat: VatId,
    pub delivery: VatDelivery,
    /// A failed delivery still consumes the run-queue item
    pub consume_on_failure: bool,
    /// Counts toward the vat's reap interval
    pub counts_as_dirt: bool,
}

/// What the runtime must do for one run-queue item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// All work was kernel-side (splat, requeue, skipped or negated item)
    None,
    Deliver(DeliveryPlan),
    /// Multi-step upgrade, driven by the runtime
    Upgrade {
        vat: VatId,
        bundle: String,
        vat_parameters: CapData,
        upgrade_message: String,
    },
    /// Host-requested termination
    Terminate {
        vat: VatId,
        reject: bool,
        info: CapData,
    },
}

impl KernelState {
    /// Decide where a `send` to `target` goes. No side effects.
    pub fn route_send(&self, target: KRef, msg: &Message) -> KernelResult<Route> {
        match target {
            KRef::Object(_) => Ok(self.send_to_object(target)),
            KRef::Promise(_) => {
                let p = self.kernel_promise(&target)?;
                match p.state {
                    PromiseState::Fulfilled => {
                        let data = p
                            .data
                            .as_ref()
                            .ok_or_else(|| KernelError::corrupt(format!("{} has no data", target)))?;
                        match single_object_slot(data) {
                            Some(object) => Ok(self.send_to_object(object)),
                            None => Ok(Route::Splat {
                                error: kernel_error(&not_callable(msg)),
                            }),
                        }
                    }
                    PromiseState::Rejected => Ok(Route::Splat {
                        error: p.data.clone().unwrap_or_else(|| kernel_error("rejected")),
                    }),
                    PromiseState::Unresolved => match p.decider {
                        None => Ok(Route::Requeue),
                        Some(decider) => {
                            if !self.is_vat_alive(&decider) {
                                Ok(Route::Splat {
                                    error: kernel_error(VAT_TERMINATED),
                                })
                            } else if self.pipelines(&decider) {
                                Ok(Route::Deliver {
                                    vat: decider,
                                    target,
                                })
                            } else {
                                Ok(Route::Requeue)
                            }
                        }
                    },
                }
            }
            KRef::Device(_) => Err(KernelError::WrongType {
                expected: "object or promise",
                found: format!("{}", target),
            }),
        }
    }

    fn send_to_object(&self, object: KRef) -> Route {
        match self.owner_of(&object) {
            Some(vat) => Route::Deliver {
                vat,
                target: object,
            },
            None => Route::Splat {
                error: kernel_error(VAT_TERMINATED),
            },
        }
    }

    fn pipelines(&self, vat: &VatId) -> bool {
        self.vats
            .get(vat)
            .map(|r| r.options.enable_pipelining)
            .unwrap_or(false)
    }

    /// Consume one run-queue item and plan its delivery.
    pub fn plan(&mut self, item: RunQueueItem) -> KernelResult<Plan> {
        match item {
            RunQueueItem::Send { target, msg } => self.plan_send(target, msg),
            RunQueueItem::Notify { vat, kpid } => {
                self.decref(kpid, RefOptions::NORMAL)?;
                if !self.is_vat_alive(&vat) {
                    return Ok(Plan::None);
                }
                if !self.kernel_promise(&kpid)?.state.is_settled() {
                    return Err(KernelError::corrupt(format!("spurious notification {}", kpid)));
                }
                // Already told: the row went away with an earlier notify
                if self.clist_entry(&Participant::Vat(vat), &kpid).is_none() {
                    return Ok(Plan::None);
                }
                let targets = self.get_kpids_to_retire(kpid);
                let delivery = self.translate_notify(vat, &targets)?;
                self.delete_clist_entries_for_kernel_slots(Participant::Vat(vat), &targets)?;
                Ok(Plan::Deliver(DeliveryPlan {
                    vat,
                    delivery,
                    consume_on_failure: false,
                    counts_as_dirt: true,
                }))
            }
            RunQueueItem::Gc { vat, kind, krefs } => {
                if !self.is_vat_alive(&vat) {
                    return Ok(Plan::None);
                }
                let krefs = self.filter_gc_action(vat, kind, &krefs);
                if krefs.is_empty() {
                    return Ok(Plan::None);
                }
                if kind == crate::queue::GcKind::RetireExports {
                    for kref in &krefs {
                        self.delete_kernel_object(*kref)?;
                    }
                }
                let delivery = self.translate_gc(vat, kind, &krefs)?;
                Ok(Plan::Deliver(DeliveryPlan {
                    vat,
                    delivery,
                    consume_on_failure: false,
                    counts_as_dirt: true,
                }))
            }
            RunQueueItem::StartVat {
                vat,
                vat_parameters,
            } => {
                if !self.is_vat_alive(&vat) {
                    self.decref_slots(&vat_parameters.slots)?;
                    return Ok(Plan::None);
                }
                let delivery = self.translate_start_vat(vat, &vat_parameters)?;
                self.decref_slots(&vat_parameters.slots)?;
                Ok(Plan::Deliver(DeliveryPlan {
                    vat,
                    delivery,
                    consume_on_failure: true,
                    counts_as_dirt: false,
                }))
            }
            RunQueueItem::UpgradeVat {
                vat,
                bundle,
                vat_parameters,
                upgrade_message,
            } => {
                if !self.is_vat_alive(&vat) {
                    self.decref_slots(&vat_parameters.slots)?;
                    return Ok(Plan::None);
                }
                Ok(Plan::Upgrade {
                    vat,
                    bundle,
                    vat_parameters,
                    upgrade_message,
                })
            }
            RunQueueItem::TerminateVat { vat, reject, info } => {
                self.decref_slots(&info.slots)?;
                Ok(Plan::Terminate { vat, reject, info })
            }
            RunQueueItem::BringOutYourDead { vat } => {
                if !self.is_vat_alive(&vat) {
                    return Ok(Plan::None);
                }
                self.reset_dirt(vat)?;
                Ok(Plan::Deliver(DeliveryPlan {
                    vat,
                    delivery: VatDelivery::BringOutYourDead,
                    consume_on_failure: false,
                    counts_as_dirt: false,
                }))
            }
        }
    }

    fn plan_send(&mut self, target: KRef, msg: Message) -> KernelResult<Plan> {
        match self.route_send(target, &msg)? {
            Route::Splat { error } => {
                if let Some(result) = msg.result {
                    self.resolve_to_error(result, error, None)?;
                }
                self.decref_message(target, &msg)?;
                Ok(Plan::None)
            }
            Route::Requeue => {
                self.add_message_to_promise_queue(target, msg)?;
                Ok(Plan::None)
            }
            Route::Deliver { vat, target: to } => {
                self.decref_message(target, &msg)?;
                let delivery = self.translate_message(vat, to, &msg)?;
                if let Some(result) = msg.result {
                    if self.pipelines(&vat) {
                        self.requeue_kernel_promise(result)?;
                    }
                }
                Ok(Plan::Deliver(DeliveryPlan {
                    vat,
                    delivery,
                    consume_on_failure: false,
                    counts_as_dirt: true,
                }))
            }
        }
    }
}

/// The object a promise was fulfilled to, when its data is exactly one
/// object reference.
fn single_object_slot(data: &CapData) -> Option<KRef> {
    if data.slots.len() != 1 || !data.slots[0].is_object() {
        return None;
    }
    let body = data.body.strip_prefix('#').unwrap_or(&data.body);
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let slot_ref = value.as_str()?;
    if slot_ref.starts_with("$0") {
        Some(data.slots[0])
    } else {
        None
    }
}

fn not_callable(msg: &Message) -> String {
    match extract_method(&msg.methargs) {
        Some(method) => format!("{}, has no method {}", DATA_NOT_CALLABLE, method),
        None => String::from(DATA_NOT_CALLABLE),
    }
}

/// Method name from `#["method",[args...]]`.
fn extract_method(methargs: &CapData) -> Option<String> {
    let body = methargs.body.strip_prefix('#')?;
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.as_array()?.first()?.as_str().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::VatOptions;
    use crate::translate::MapOptions;
    use crate::types::{Participant, VRef};
    use alloc::vec;

    fn two_vats(pipelining: bool) -> (KernelState, VatId, VatId) {
        let mut state = KernelState::new();
        let (a, _) = state
            .create_vat("a", "b", VatOptions::default(), CapData::bare("#{}"))
            .unwrap();
        let opts = VatOptions {
            enable_pipelining: pipelining,
            ..VatOptions::default()
        };
        let (b, _) = state.create_vat("b", "b", opts, CapData::bare("#{}")).unwrap();
        while state.pop_run_queue().unwrap().is_some() {}
        (state, a, b)
    }

    fn call(method: &str) -> CapData {
        CapData::bare(format!("#[\"{}\",[]]", method))
    }

    #[test]
    fn test_single_object_slot() {
        let ko = KRef::Object(20);
        assert_eq!(
            single_object_slot(&CapData::new("#\"$0.Alleged: x\"", vec![ko])),
            Some(ko)
        );
        assert_eq!(single_object_slot(&CapData::new("#[\"$0\"]", vec![ko])), None);
        assert_eq!(single_object_slot(&CapData::bare("#3")), None);
    }

    #[test]
    fn test_route_to_fulfilled_data_splats() {
        let (mut state, _, _) = two_vats(false);
        let kp = state.add_kernel_promise(None).unwrap();
        state
            .resolve_kernel_promise(kp, false, CapData::bare("#3"))
            .unwrap();
        let route = state
            .route_send(kp, &Message::new(call("foo"), None))
            .unwrap();
        assert_eq!(
            route,
            Route::Splat {
                error: kernel_error("data is not callable, has no method foo")
            }
        );
    }

    #[test]
    fn test_route_unresolved() {
        let (mut state, a, b) = two_vats(true);
        let msg = Message::new(call("foo"), None);

        let free = state.add_kernel_promise(None).unwrap();
        assert_eq!(state.route_send(free, &msg).unwrap(), Route::Requeue);

        let by_a = state.add_kernel_promise(Some(a)).unwrap();
        assert_eq!(state.route_send(by_a, &msg).unwrap(), Route::Requeue);

        let by_b = state.add_kernel_promise(Some(b)).unwrap();
        assert_eq!(
            state.route_send(by_b, &msg).unwrap(),
            Route::Deliver {
                vat: b,
                target: by_b
            }
        );

        state.terminate_vat(a).unwrap();
        let by_dead = state.add_kernel_promise(None).unwrap();
        state.set_decider(by_dead, Some(a)).unwrap();
        assert_eq!(
            state.route_send(by_dead, &msg).unwrap(),
            Route::Splat {
                error: kernel_error(VAT_TERMINATED)
            }
        );
    }

    #[test]
    fn test_splat_rejects_result_and_releases_refs() {
        let (mut state, a, _) = two_vats(false);
        let root_a = state.vat_root(a).unwrap();
        state.terminate_vat(a).unwrap();

        let kp = state
            .queue_to_kref(root_a, call("foo"), true)
            .unwrap()
            .unwrap();
        let item = state.pop_run_queue().unwrap().unwrap();
        assert_eq!(state.plan(item).unwrap(), Plan::None);

        let p = state.promise(&kp).unwrap();
        assert_eq!(p.state, PromiseState::Rejected);
        assert_eq!(p.data, Some(kernel_error(VAT_TERMINATED)));
        // Only the host hold remains
        assert_eq!(p.refcount, 1);
    }

    #[test]
    fn test_notify_skipped_without_clist_row() {
        let (mut state, a, _) = two_vats(false);
        let kp = state.add_kernel_promise(None).unwrap();
        state
            .resolve_kernel_promise(kp, false, CapData::bare("#1"))
            .unwrap();
        state.notify(a, kp).unwrap();
        let item = state.pop_run_queue().unwrap().unwrap();
        assert_eq!(state.plan(item).unwrap(), Plan::None);
        assert!(state.maybe_free().contains(&kp));
    }

    #[test]
    fn test_pipelined_delivery_requeues_result_queue() {
        let (mut state, _, b) = two_vats(true);
        let root_b = state.vat_root(b).unwrap();
        let result = state
            .queue_to_kref(root_b, call("make"), true)
            .unwrap()
            .unwrap();
        // A second message waits on the first one's result
        state.queue_to_kref(result, call("use"), false).unwrap();

        let first = state.pop_run_queue().unwrap().unwrap();
        let second = state.pop_run_queue().unwrap().unwrap();
        // Nobody decides the result yet: queued on the promise
        assert_eq!(state.plan(second).unwrap(), Plan::None);
        assert_eq!(state.promise(&result).unwrap().queue.len(), 1);

        let Plan::Deliver(plan) = state.plan(first).unwrap() else {
            panic!("expected delivery");
        };
        assert_eq!(plan.vat, b);
        assert_eq!(state.promise(&result).unwrap().decider, Some(b));
        // The waiting message is back on the run queue, now routable to b
        let requeued = state.pop_run_queue().unwrap().unwrap();
        let Plan::Deliver(plan) = state.plan(requeued).unwrap() else {
            panic!("expected pipelined delivery");
        };
        let VatDelivery::Message { target, .. } = plan.delivery else {
            panic!("expected message");
        };
        assert_eq!(
            state.lookup_vref(&Participant::Vat(b), &target),
            Some(result)
        );
    }

    #[test]
    fn test_gc_item_for_dead_vat_is_skipped() {
        let (mut state, a, b) = two_vats(false);
        let ko = state
            .map_vat_slot_to_kernel(Participant::Vat(a), VRef::object_export(1), MapOptions::DEFAULT)
            .unwrap();
        state.map_kernel_slot_to_vat(Participant::Vat(b), ko, MapOptions::DEFAULT).unwrap();
        state.terminate_vat(a).unwrap();
        let plan = state
            .plan(RunQueueItem::Gc {
                vat: a,
                kind: crate::queue::GcKind::DropExports,
                krefs: vec![ko],
            })
            .unwrap();
        assert_eq!(plan, Plan::None);
    }
}
