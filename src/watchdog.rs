//! Per-fiber watchdog.
//!
//! A watchdog wraps the fiber's result promise and supervises every node of
//! the fiber's graph until that promise settles. It classifies each graph
//! event (ownership check on init, abort check on init and resolve), keeps
//! the set of pending execution targets, and coalesces a stall probe that
//! fires after the current turn drains. The first fault wins: it settles
//! the wrapped promise, and when it was observed inside a hook callback it
//! also unwinds through the hook so the violating operation fails
//! synchronously.

use crate::fault::{Fault, FaultCode};
use crate::fiber::Fiber;
use crate::metrics;
use crate::node::{self, flags, AsyncNode, AsyncObserver};
use crate::runtime::{CancelSignal, CheckHandle, EventLoop, LoopInner, Promise, ResourceKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

struct WatchState {
    /// Unfinalized nodes of this fiber, in creation order.
    pending: BTreeMap<u64, Weak<AsyncNode>>,
    probe: Option<CheckHandle>,
}

pub(crate) struct Watchdog {
    fiber_id: u64,
    /// Ids of every ancestor fiber at launch time.
    parent_ids: Vec<u64>,
    fiber: Weak<Fiber>,
    root: Weak<AsyncNode>,
    root_id: u64,
    rt: Weak<LoopInner>,
    signal: Option<CancelSignal>,
    self_ref: Weak<Watchdog>,
    sink: Box<dyn Fn(Fault)>,
    faulted: AtomicBool,
    settled: AtomicBool,
    state: Mutex<WatchState>,
}

impl Watchdog {
    /// Wraps `inner` and starts supervising `fiber`'s graph. Call while the
    /// fiber is still active so the wrapper's own resource is rooted in it.
    pub(crate) fn supervise<T: Clone + 'static>(
        fiber: &Arc<Fiber>,
        inner: Promise<T>,
        signal: Option<CancelSignal>,
    ) -> Promise<T> {
        let root = fiber.root();
        // The root stops generating init notifications into itself for the
        // rest of the fiber's lifetime.
        root.set_active(false);

        let rt = EventLoop::current();
        let (outer, _resolver) = Promise::<T>::pending();

        let mut parent_ids = Vec::new();
        let mut ancestor = fiber.parent().cloned();
        while let Some(p) = ancestor {
            parent_ids.push(p.fiber_id());
            ancestor = p.parent().cloned();
        }

        let sink_target = outer.clone();
        let wd = Arc::new_cyclic(|self_ref| Watchdog {
            fiber_id: fiber.fiber_id(),
            parent_ids,
            fiber: Arc::downgrade(fiber),
            root: Arc::downgrade(&root),
            root_id: root.async_id(),
            rt: rt.inner_weak(),
            signal: signal.clone(),
            self_ref: self_ref.clone(),
            sink: Box::new(move |fault| sink_target.settle(Err(fault))),
            faulted: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            state: Mutex::new(WatchState {
                pending: BTreeMap::new(),
                probe: None,
            }),
        });

        if let Some(signal) = &signal {
            let root = Arc::downgrade(&root);
            signal.subscribe(move |_reason| {
                if let Some(root) = root.upgrade() {
                    node::taint(&root, flags::FINALIZED, flags::ABORTED);
                }
            });
        }

        // Nodes the fiber created before supervision started: observe them,
        // seed the pending set, and validate them right away.
        root.walk_owned(wd.fiber_id, &mut |n| {
            if n.is_finalized() {
                return;
            }
            if let Some(me) = wd.self_ref.upgrade() {
                n.set_observer(me);
            }
            wd.state.lock().pending.insert(n.async_id(), Arc::downgrade(n));
            if let Err(fault) = wd
                .validate_ownership(n)
                .and_then(|()| wd.validate_abort(n))
            {
                wd.trip(fault);
            }
        });

        wd.arm_probe();

        let wd_settle = Arc::clone(&wd);
        let outer_settle = outer.clone();
        inner.on_settle(move |outcome| {
            wd_settle.settled.store(true, Ordering::Release);
            wd_settle.cancel_probe();
            if !wd_settle.faulted.load(Ordering::Acquire) {
                outer_settle.settle(outcome.clone());
            }
        });

        outer
    }

    fn fault(&self, code: FaultCode, node: Option<&Arc<AsyncNode>>) -> Fault {
        let reason = match code {
            FaultCode::FiberAborted | FaultCode::ForeignAsyncAborted => {
                self.signal.as_ref().and_then(CancelSignal::reason)
            }
            _ => None,
        };
        Fault::new(code, self.fiber_id, self.fiber.upgrade(), node, reason)
    }

    /// First fault wins; later ones are swallowed.
    fn trip(&self, fault: Fault) {
        if self.faulted.swap(true, Ordering::AcqRel) {
            return;
        }
        metrics::global().fault_raised();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            fiber_id = self.fiber_id,
            code = %fault.code(),
            "fiber fault"
        );

        self.cancel_probe();
        (self.sink)(fault);
    }

    fn validate_ownership(&self, node: &Arc<AsyncNode>) -> Result<(), Fault> {
        let Some(trigger) = node.trigger_origin() else {
            return Ok(());
        };
        if node.fiber_id() != self.fiber_id {
            // Another fiber's resource: not our problem.
            return Ok(());
        }
        if trigger.async_id() == self.root_id {
            // Direct work kicked off at the fiber boundary.
            return Ok(());
        }
        if trigger.fiber_id() == node.fiber_id() {
            return Ok(());
        }
        if self.parent_ids.contains(&trigger.fiber_id()) {
            return Err(self.fault(FaultCode::ParentAsyncTrigger, Some(node)));
        }
        Err(self.fault(FaultCode::ForeignAsyncTrigger, Some(node)))
    }

    fn validate_abort(&self, node: &Arc<AsyncNode>) -> Result<(), Fault> {
        if node.is_aborted() {
            return Err(self.fault(FaultCode::FiberAborted, Some(node)));
        }
        if let Some(trigger) = node.trigger_origin() {
            if trigger.is_aborted() {
                return Err(if trigger.fiber_id() == self.fiber_id {
                    self.fault(FaultCode::FiberAborted, Some(node))
                } else {
                    self.fault(FaultCode::ForeignAsyncAborted, Some(node))
                });
            }
        }
        if let Some(signal) = &self.signal {
            if signal.is_raised() {
                return Err(self.fault(FaultCode::FiberAborted, Some(node)));
            }
        }
        Ok(())
    }

    /// Re-arms the coalesced stall probe: one live probe at a time, firing
    /// after the current turn's work drains.
    fn arm_probe(&self) {
        if self.faulted.load(Ordering::Acquire) || self.settled.load(Ordering::Acquire) {
            return;
        }
        let Some(inner) = self.rt.upgrade() else {
            return;
        };
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        let handle = EventLoop::from_inner(inner).schedule_check(move || me.stall_check());
        if let Some(old) = self.state.lock().probe.replace(handle) {
            old.cancel();
        }
    }

    fn cancel_probe(&self) {
        if let Some(probe) = self.state.lock().probe.take() {
            probe.cancel();
        }
    }

    /// The deferred stall check. Anything unfinalized that is not a promise
    /// is real asynchronous work and will eventually wake the fiber;
    /// otherwise nothing ever will, and the fiber is stalled.
    fn stall_check(&self) {
        if self.faulted.load(Ordering::Acquire) || self.settled.load(Ordering::Acquire) {
            return;
        }
        metrics::global().stall_probe();

        let pending: Vec<Arc<AsyncNode>> = {
            let mut state = self.state.lock();
            state.pending.retain(|_, n| n.upgrade().is_some());
            state.pending.values().filter_map(Weak::upgrade).collect()
        };
        for n in &pending {
            if !n.is_finalized() && n.kind() != ResourceKind::Promise {
                return;
            }
        }
        let culprit = pending
            .iter()
            .rev()
            .find(|n| !n.is_finalized())
            .cloned()
            .or_else(|| self.root.upgrade().and_then(|r| r.last_execution_target()))
            .or_else(|| self.root.upgrade());
        let fault = self.fault(FaultCode::FiberStall, culprit.as_ref());
        self.trip(fault);
    }
}

impl AsyncObserver for Watchdog {
    fn on_init(&self, node: &Arc<AsyncNode>) -> Result<(), Fault> {
        if node.fiber_id() != self.fiber_id {
            self.arm_probe();
            return Ok(());
        }
        if let Err(fault) = self
            .validate_ownership(node)
            .and_then(|()| self.validate_abort(node))
        {
            self.trip(fault.clone());
            return Err(fault);
        }
        if let Some(me) = self.self_ref.upgrade() {
            node.set_observer(me);
        }
        self.state.lock().pending.insert(node.async_id(), Arc::downgrade(node));
        self.arm_probe();
        Ok(())
    }

    fn on_before(&self, _node: &Arc<AsyncNode>) {
        self.arm_probe();
    }

    fn on_after(&self, node: &Arc<AsyncNode>) {
        self.state.lock().pending.remove(&node.async_id());
        self.arm_probe();
    }

    fn on_resolve(&self, node: &Arc<AsyncNode>) -> Result<(), Fault> {
        let verdict = self.validate_abort(node);
        self.state.lock().pending.remove(&node.async_id());
        match verdict {
            Ok(()) => {
                self.arm_probe();
                Ok(())
            }
            Err(fault) => {
                self.trip(fault.clone());
                Err(fault)
            }
        }
    }
}
