//! Fiber records and the public isolation surface.
//!
//! A fiber anchors on the shadow node of the execution context it was
//! launched from. The fiber stack is a thread-local singleton; activating
//! the first fiber arms the loop's hooks and deactivating the last disarms
//! them, so instrumentation costs nothing while no fiber exists.

use crate::metrics;
use crate::node::AsyncNode;
use crate::runtime::{CancelSignal, EventLoop, LoopInner, Promise, Resource};
use crate::watchdog::Watchdog;
use std::cell::RefCell;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Fiber ids are process-unique and increase monotonically from 1.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static FIBER_STACK: RefCell<Vec<Arc<Fiber>>> = const { RefCell::new(Vec::new()) };
}

/// A named unit of asynchronous isolation.
pub struct Fiber {
    fiber_id: u64,
    root: Arc<AsyncNode>,
    parent: Option<Arc<Fiber>>,
    active: AtomicBool,
    frame: Option<&'static Location<'static>>,
    rt: Weak<LoopInner>,
}

impl Fiber {
    /// Captures the current execution context as a new fiber's root. The
    /// context gets a shadow node on the spot when it has none yet.
    fn new(frame: Option<&'static Location<'static>>) -> Arc<Self> {
        let rt = EventLoop::current();
        let resource = rt.execution_resource();
        let fiber_id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        let root = fiber_node(&resource)
            .unwrap_or_else(|| AsyncNode::root(&resource, fiber_id));
        Arc::new(Self {
            fiber_id,
            root,
            parent: current_fiber(),
            active: AtomicBool::new(false),
            frame,
            rt: rt.inner_weak(),
        })
    }

    /// Process-unique fiber id.
    #[must_use]
    pub fn fiber_id(&self) -> u64 {
        self.fiber_id
    }

    /// The node of the execution context the fiber was launched from.
    #[must_use]
    pub fn root(&self) -> Arc<AsyncNode> {
        Arc::clone(&self.root)
    }

    /// The fiber that was active at launch time.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Fiber>> {
        self.parent.as_ref()
    }

    /// Whether this fiber currently claims its root.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Launch-site frame, when captured.
    #[must_use]
    pub fn frame(&self) -> Option<&'static Location<'static>> {
        self.frame
    }

    /// Counts every unfinalized descendant of the root owned by this fiber,
    /// the root itself excluded.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        let mut count = 0;
        self.root.walk_owned(self.fiber_id, &mut |n| {
            if !n.is_finalized() {
                count += 1;
            }
        });
        count
    }

    /// Direct children of the root owned by this fiber.
    #[must_use]
    pub fn execution_targets(&self) -> Vec<Arc<AsyncNode>> {
        self.root
            .execution_targets()
            .into_iter()
            .filter(|n| n.fiber_id() == self.fiber_id)
            .collect()
    }

    /// Claims the root, pushes onto the fiber stack, and arms the loop's
    /// hooks when this is the first fiber.
    pub(crate) fn activate(self: &Arc<Self>) {
        self.root.set_fiber_id(self.fiber_id);
        self.active.store(true, Ordering::Release);
        let was_empty = FIBER_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let was_empty = stack.is_empty();
            stack.push(Arc::clone(self));
            was_empty
        });
        if was_empty {
            if let Some(inner) = self.rt.upgrade() {
                EventLoop::from_inner(inner)
                    .hooks()
                    .install(Arc::new(crate::hooks::GraphAdapter));
            }
        }
        metrics::global().fiber_launched();

        #[cfg(feature = "tracing")]
        tracing::debug!(fiber_id = self.fiber_id, armed = was_empty, "fiber activated");
    }

    /// Removes this fiber from the stack (not necessarily the top), returns
    /// the root stamp to the topmost remaining active fiber (or 0), and
    /// disarms the hooks when the stack empties.
    pub(crate) fn deactivate(self: &Arc<Self>) {
        self.active.store(false, Ordering::Release);
        let (emptied, next_id) = FIBER_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.retain(|f| f.fiber_id != self.fiber_id);
            let next_id = stack
                .iter()
                .rev()
                .find(|f| f.is_active())
                .map_or(0, |f| f.fiber_id);
            (stack.is_empty(), next_id)
        });
        self.root.set_fiber_id(next_id);
        if emptied {
            if let Some(inner) = self.rt.upgrade() {
                EventLoop::from_inner(inner).hooks().clear();
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(fiber_id = self.fiber_id, disarmed = emptied, "fiber deactivated");
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("fiber_id", &self.fiber_id)
            .field("root", &self.root.async_id())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Parameters of [`fiber_with`].
#[derive(Debug, Default)]
pub struct FiberOptions {
    /// Cancellation signal; raising it taints the fiber's reachable graph.
    pub abort: Option<CancelSignal>,
}

/// A launched fiber and its supervised result.
pub struct FiberHandle<T> {
    /// The watchdog-wrapped result of the fiber body.
    pub result: Promise<T>,
    /// The fiber record.
    pub fiber: Arc<Fiber>,
}

impl<T: Clone + 'static> fmt::Debug for FiberHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("result", &self.result)
            .field("fiber", &self.fiber)
            .finish()
    }
}

/// Ensures an active fiber exists: returns the current one, or creates and
/// activates a fiber anchored on the current execution context.
///
/// # Panics
///
/// Panics when no event loop is in scope.
#[track_caller]
pub fn enable() -> Arc<Fiber> {
    if let Some(fiber) = current_fiber() {
        return fiber;
    }
    let fiber = Fiber::new(Some(Location::caller()));
    fiber.activate();
    fiber
}

/// Deactivates the current fiber, returning it.
pub fn disable() -> Option<Arc<Fiber>> {
    let fiber = current_fiber()?;
    fiber.deactivate();
    Some(fiber)
}

/// The topmost active fiber on the stack.
#[must_use]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    FIBER_STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|f| f.is_active())
            .cloned()
    })
}

/// The shadow node attached to a raw resource, if any.
#[must_use]
pub fn fiber_node(resource: &Resource) -> Option<Arc<AsyncNode>> {
    resource.sentinel()
}

/// Launches `body` in a fresh fiber. See [`fiber_with`].
///
/// # Panics
///
/// Panics when no event loop is in scope.
#[track_caller]
pub fn fiber<T, F>(body: F) -> FiberHandle<T>
where
    T: Clone + 'static,
    F: FnOnce() -> Promise<T>,
{
    launch(body, FiberOptions::default(), Location::caller())
}

/// Launches `body` in a fresh fiber with options.
///
/// The body runs synchronously inside the activated fiber, so the resource
/// chain of the promise it returns is rooted in the fiber. The returned
/// handle's `result` is the watchdog-wrapped promise: it settles with the
/// body's outcome, or rejects with the first [`Fault`](crate::Fault) the
/// watchdog observes.
///
/// # Panics
///
/// Panics when no event loop is in scope.
#[track_caller]
pub fn fiber_with<T, F>(body: F, options: FiberOptions) -> FiberHandle<T>
where
    T: Clone + 'static,
    F: FnOnce() -> Promise<T>,
{
    launch(body, options, Location::caller())
}

fn launch<T, F>(body: F, options: FiberOptions, frame: &'static Location<'static>) -> FiberHandle<T>
where
    T: Clone + 'static,
    F: FnOnce() -> Promise<T>,
{
    let fiber = Fiber::new(Some(frame));
    fiber.activate();
    let inner = body();
    let result = Watchdog::supervise(&fiber, inner, options.abort);
    fiber.deactivate();
    FiberHandle { result, fiber }
}
