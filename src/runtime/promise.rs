//! Deferred values in the host loop's callback style.
//!
//! A [`Promise`] is backed by a `PROMISE` resource. Settling fires the
//! promise-resolve hook; reactions registered through [`Promise::then`] and
//! [`Promise::and_then`] run as microtasks inside their own derived
//! resource's execution context, so every await is visible to the shadow
//! graph as an init whose trigger is the awaited promise.

use super::{EventLoop, LoopInner, Resource, ResourceKind};
use crate::fault::Fault;
use parking_lot::Mutex;
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Weak};

/// Settlement state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleState {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Fulfilled,
    /// Settled with a fault.
    Rejected,
}

type Callback<T> = Box<dyn FnOnce(&Result<T, Fault>)>;

struct PromiseInner<T> {
    outcome: Option<Result<T, Fault>>,
    settling: bool,
    reactions: Vec<(Resource, Callback<T>)>,
    watchers: Vec<Callback<T>>,
}

struct PromiseShared<T> {
    resource: Resource,
    rt: Weak<LoopInner>,
    state: Mutex<PromiseInner<T>>,
}

/// A deferred value produced by the embedded loop.
///
/// Values settle exactly once, either with `T` or with a [`Fault`]; the
/// first settlement wins and later ones are ignored.
pub struct Promise<T> {
    shared: Arc<PromiseShared<T>>,
}

/// The settling half of a [`Promise`]. Consumed on use.
pub struct Resolver<T> {
    shared: Arc<PromiseShared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// Creates an unsettled promise and its resolver.
    ///
    /// # Panics
    ///
    /// Panics when no event loop is in scope.
    #[track_caller]
    #[must_use]
    pub fn pending() -> (Self, Resolver<T>) {
        Self::pending_at(Location::caller())
    }

    /// Creates a promise already settled with `value`.
    ///
    /// # Panics
    ///
    /// Panics when no event loop is in scope.
    #[track_caller]
    #[must_use]
    pub fn resolved(value: T) -> Self {
        let (promise, resolver) = Self::pending_at(Location::caller());
        resolver.resolve(value);
        promise
    }

    /// Creates a promise already rejected with `fault`.
    ///
    /// # Panics
    ///
    /// Panics when no event loop is in scope.
    #[track_caller]
    #[must_use]
    pub fn rejected(fault: Fault) -> Self {
        let (promise, resolver) = Self::pending_at(Location::caller());
        resolver.reject(fault);
        promise
    }

    fn pending_at(frame: &'static Location<'static>) -> (Self, Resolver<T>) {
        let rt = EventLoop::current();
        let (resource, fault) = rt.create_resource(ResourceKind::Promise, None, Some(frame));
        let shared = Arc::new(PromiseShared {
            resource,
            rt: rt.inner_weak(),
            state: Mutex::new(PromiseInner {
                outcome: None,
                settling: false,
                reactions: Vec::new(),
                watchers: Vec::new(),
            }),
        });
        let promise = Self {
            shared: Arc::clone(&shared),
        };
        let resolver = Resolver { shared };
        if let Some(fault) = fault {
            promise.settle(Err(fault));
        }
        (promise, resolver)
    }

    fn adopt(resource: Resource, rt: Weak<LoopInner>) -> Self {
        Self {
            shared: Arc::new(PromiseShared {
                resource,
                rt,
                state: Mutex::new(PromiseInner {
                    outcome: None,
                    settling: false,
                    reactions: Vec::new(),
                    watchers: Vec::new(),
                }),
            }),
        }
    }

    /// The backing resource.
    #[must_use]
    pub fn resource(&self) -> &Resource {
        &self.shared.resource
    }

    /// Id of the backing resource.
    #[must_use]
    pub fn async_id(&self) -> u64 {
        self.shared.resource.async_id()
    }

    /// Current settlement state.
    #[must_use]
    pub fn state(&self) -> SettleState {
        match &self.shared.state.lock().outcome {
            None => SettleState::Pending,
            Some(Ok(_)) => SettleState::Fulfilled,
            Some(Err(_)) => SettleState::Rejected,
        }
    }

    /// The settled outcome, when available.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<T, Fault>> {
        self.shared.state.lock().outcome.clone()
    }

    /// Derives a promise settling with `f` applied to this promise's value.
    /// Rejections pass through untouched.
    ///
    /// # Panics
    ///
    /// Panics when no event loop is in scope.
    #[track_caller]
    pub fn then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let frame = Location::caller();
        let rt = EventLoop::current();
        let (resource, fault) =
            rt.create_resource(ResourceKind::Promise, Some(self.async_id()), Some(frame));
        let derived = Promise::<U>::adopt(resource.clone(), rt.inner_weak());
        if let Some(fault) = fault {
            derived.settle(Err(fault));
            return derived;
        }
        let target = derived.clone();
        self.add_reaction(
            resource,
            Box::new(move |outcome| match outcome {
                Ok(value) => target.settle(Ok(f(value.clone()))),
                Err(fault) => target.settle(Err(fault.clone())),
            }),
        );
        derived
    }

    /// Derives a promise that adopts the promise returned by `f`.
    ///
    /// Adoption goes through an instrumented link resource triggered by the
    /// inner promise, so chaining onto a promise owned by another fiber is
    /// observable exactly like any other await.
    ///
    /// # Panics
    ///
    /// Panics when no event loop is in scope.
    #[track_caller]
    pub fn and_then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Promise<U> + 'static,
    {
        let frame = Location::caller();
        let rt = EventLoop::current();
        let (resource, fault) =
            rt.create_resource(ResourceKind::Promise, Some(self.async_id()), Some(frame));
        let derived = Promise::<U>::adopt(resource.clone(), rt.inner_weak());
        if let Some(fault) = fault {
            derived.settle(Err(fault));
            return derived;
        }
        let target = derived.clone();
        self.add_reaction(
            resource,
            Box::new(move |outcome| match outcome {
                Ok(value) => {
                    let inner = f(value.clone());
                    match EventLoop::try_current() {
                        Some(rt) => {
                            let (link, fault) = rt.create_resource(
                                ResourceKind::Promise,
                                Some(inner.async_id()),
                                None,
                            );
                            if let Some(fault) = fault {
                                target.settle(Err(fault));
                            } else {
                                let target = target.clone();
                                inner.add_reaction(
                                    link,
                                    Box::new(move |outcome| target.settle(outcome.clone())),
                                );
                            }
                        }
                        // Loop gone: adopt without instrumentation.
                        None => {
                            let target = target.clone();
                            inner.on_settle(move |outcome| target.settle(outcome.clone()));
                        }
                    }
                }
                Err(fault) => target.settle(Err(fault.clone())),
            }),
        );
        derived
    }

    /// Registers an uninstrumented settle watcher. Watchers run
    /// synchronously at settlement, outside any resource context; the
    /// watchdog uses this to observe the fiber result without adding nodes
    /// to the graph it supervises.
    pub(crate) fn on_settle(&self, f: impl FnOnce(&Result<T, Fault>) + 'static) {
        let outcome = {
            let mut state = self.shared.state.lock();
            match &state.outcome {
                None => {
                    state.watchers.push(Box::new(f));
                    return;
                }
                Some(outcome) => outcome.clone(),
            }
        };
        f(&outcome);
    }

    pub(crate) fn add_reaction(&self, resource: Resource, f: Callback<T>) {
        let outcome = {
            let mut state = self.shared.state.lock();
            match &state.outcome {
                None => {
                    state.reactions.push((resource, f));
                    return;
                }
                Some(outcome) => outcome.clone(),
            }
        };
        self.enqueue(resource, f, outcome);
    }

    fn enqueue(&self, resource: Resource, f: Callback<T>, outcome: Result<T, Fault>) {
        match self.shared.rt.upgrade() {
            Some(inner) => {
                EventLoop::from_inner(inner)
                    .enqueue_reaction(resource, Box::new(move || f(&outcome)));
            }
            // Loop gone: degrade to a synchronous call so settlements are
            // never silently lost.
            None => f(&outcome),
        }
    }

    /// Settles the promise, first settlement wins. Fires the
    /// promise-resolve hook; a faulting hook downgrades a fulfillment into
    /// a rejection while an existing rejection keeps priority.
    pub(crate) fn settle(&self, outcome: Result<T, Fault>) {
        {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() || state.settling {
                return;
            }
            state.settling = true;
        }
        let hook = match self.shared.rt.upgrade() {
            Some(inner) => EventLoop::from_inner(inner).dispatch_resolve(self.async_id()),
            None => Ok(()),
        };
        let outcome = match (outcome, hook) {
            (Ok(_), Err(fault)) => Err(fault),
            (outcome, _) => outcome,
        };
        let (reactions, watchers) = {
            let mut state = self.shared.state.lock();
            state.outcome = Some(outcome.clone());
            state.settling = false;
            (
                std::mem::take(&mut state.reactions),
                std::mem::take(&mut state.watchers),
            )
        };
        for watcher in watchers {
            watcher(&outcome);
        }
        for (resource, f) in reactions {
            self.enqueue(resource, f, outcome.clone());
        }
    }
}

impl<T: Clone + 'static> Resolver<T> {
    /// Resolves the promise with `value`. No-op when already settled.
    pub fn resolve(self, value: T) {
        Promise {
            shared: self.shared,
        }
        .settle(Ok(value));
    }

    /// Rejects the promise with `fault`. No-op when already settled.
    pub fn reject(self, fault: Fault) {
        Promise {
            shared: self.shared,
        }
        .settle(Err(fault));
    }
}

impl<T: Clone + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.shared.state.lock().outcome {
            None => "pending",
            Some(Ok(_)) => "fulfilled",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("Promise")
            .field("async_id", &self.async_id())
            .field("state", &state)
            .finish()
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("async_id", &self.shared.resource.async_id())
            .finish()
    }
}
