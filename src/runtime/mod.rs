//! Embedded cooperative single-threaded event loop.
//!
//! The isolation layer observes a host runtime; this module is that host: a
//! deterministic loop with a macrotask queue (immediates, simulated I/O,
//! stall probes), a microtask queue (promise reactions), an execution-context
//! stack, and a [`HookRegistry`](crate::HookRegistry) through which every
//! resource lifecycle event is reported. One turn drains the microtask queue
//! and then runs a single macrotask inside before/after hook envelopes.
//!
//! The loop is deliberately small and fully deterministic so isolation
//! behavior can be exercised turn by turn in tests.

mod cancel;
mod promise;

pub use cancel::{CancelSignal, CancelSource};
pub use promise::{Promise, Resolver, SettleState};

use crate::fault::Fault;
use crate::hooks::HookRegistry;
use crate::node::AsyncNode;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Resource ids are unique across the process lifetime, whichever loop
/// allocated them.
static NEXT_ASYNC_ID: AtomicU64 = AtomicU64::new(1);

/// Category of an asynchronous resource, as reported through `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// The execution context a loop starts in.
    Root,
    /// A deferred value.
    Promise,
    /// A `set_immediate` callback entry.
    Immediate,
    /// A simulated I/O completion.
    Io,
}

impl ResourceKind {
    /// Stable string form of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Root => "ROOT",
            Self::Promise => "PROMISE",
            Self::Immediate => "Immediate",
            Self::Io => "IO",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ResourceCell {
    async_id: u64,
    kind: ResourceKind,
    frame: Option<&'static Location<'static>>,
    // Sentinel slot. Written and read only by the graph layer.
    node: RwLock<Option<Arc<AsyncNode>>>,
}

/// A raw asynchronous resource object of the host loop.
///
/// Carries the process-unique id, the category, the best-effort creation
/// frame, and the sentinel slot the graph layer attaches its shadow node to.
#[derive(Clone)]
pub struct Resource {
    cell: Arc<ResourceCell>,
}

impl Resource {
    fn allocate(kind: ResourceKind, frame: Option<&'static Location<'static>>) -> Self {
        Self {
            cell: Arc::new(ResourceCell {
                async_id: NEXT_ASYNC_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                frame,
                node: RwLock::new(None),
            }),
        }
    }

    /// Allocates a resource that is not announced to any loop. Unit-test
    /// plumbing only.
    #[cfg(test)]
    pub(crate) fn detached(kind: ResourceKind) -> Self {
        Self::allocate(kind, None)
    }

    /// Process-unique resource id.
    #[must_use]
    pub fn async_id(&self) -> u64 {
        self.cell.async_id
    }

    /// Resource category.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.cell.kind
    }

    pub(crate) fn frame(&self) -> Option<&'static Location<'static>> {
        self.cell.frame
    }

    pub(crate) fn sentinel(&self) -> Option<Arc<AsyncNode>> {
        self.cell.node.read().clone()
    }

    pub(crate) fn attach_sentinel(&self, node: Arc<AsyncNode>) {
        *self.cell.node.write() = Some(node);
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("async_id", &self.cell.async_id)
            .field("kind", &self.cell.kind)
            .finish()
    }
}

enum Job {
    /// An instrumented callback: runs inside its resource's execution
    /// context with before/after envelopes.
    Callback {
        resource: Resource,
        run: Box<dyn FnOnce()>,
    },
    /// An uninstrumented one-shot, used for the watchdog's stall probe.
    Check {
        cancelled: Arc<AtomicBool>,
        run: Box<dyn FnOnce()>,
    },
}

/// Cancellation handle of a scheduled check job.
pub(crate) struct CheckHandle {
    cancelled: Arc<AtomicBool>,
}

impl CheckHandle {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

pub(crate) struct LoopInner {
    macrotasks: Mutex<VecDeque<Job>>,
    microtasks: Mutex<VecDeque<Job>>,
    exec_stack: Mutex<Vec<Resource>>,
    hooks: HookRegistry,
    root: Resource,
}

/// Handle to an embedded event loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

thread_local! {
    static CURRENT: std::cell::RefCell<Vec<EventLoop>> = const { std::cell::RefCell::new(Vec::new()) };
}

struct CurrentGuard;

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            c.borrow_mut().pop();
        });
    }
}

impl EventLoop {
    /// Creates a fresh loop with an empty root execution context.
    #[must_use]
    pub fn new() -> Self {
        let root = Resource::allocate(ResourceKind::Root, None);
        Self {
            inner: Arc::new(LoopInner {
                macrotasks: Mutex::new(VecDeque::new()),
                microtasks: Mutex::new(VecDeque::new()),
                exec_stack: Mutex::new(vec![root.clone()]),
                hooks: HookRegistry::new(),
                root,
            }),
        }
    }

    /// The loop the current thread is executing inside.
    ///
    /// # Panics
    ///
    /// Panics when called outside [`EventLoop::scope`], [`EventLoop::turn`]
    /// or [`EventLoop::run`].
    #[must_use]
    pub fn current() -> Self {
        Self::try_current().expect(
            "no event loop in scope; enter one with EventLoop::scope, turn or run",
        )
    }

    /// Non-panicking variant of [`EventLoop::current`].
    #[must_use]
    pub fn try_current() -> Option<Self> {
        CURRENT.with(|c| c.borrow().last().cloned())
    }

    fn enter(&self) -> CurrentGuard {
        CURRENT.with(|c| c.borrow_mut().push(self.clone()));
        CurrentGuard
    }

    pub(crate) fn from_inner(inner: Arc<LoopInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner_weak(&self) -> Weak<LoopInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    /// Runs `f` with this loop as the thread's current loop, inside the
    /// root execution context.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }

    /// The resource whose execution context is current.
    #[must_use]
    pub fn execution_resource(&self) -> Resource {
        self.inner
            .exec_stack
            .lock()
            .last()
            .cloned()
            .unwrap_or_else(|| self.inner.root.clone())
    }

    /// Id of the current execution context's resource.
    #[must_use]
    pub fn execution_async_id(&self) -> u64 {
        self.execution_resource().async_id()
    }

    /// Whether both task queues are empty.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.inner.macrotasks.lock().is_empty() && self.inner.microtasks.lock().is_empty()
    }

    /// Drains microtasks, then runs at most one macrotask. Returns whether
    /// any work ran.
    pub fn turn(&self) -> bool {
        let _guard = self.enter();
        let mut worked = self.drain_microtasks();
        if let Some(job) = self.pop_macrotask() {
            self.run_job(job);
            worked = true;
        }
        worked
    }

    /// Runs turns until the loop is quiescent; returns how many turns ran.
    pub fn run(&self) -> u64 {
        let mut turns = 0;
        while self.turn() {
            turns += 1;
        }
        turns
    }

    fn drain_microtasks(&self) -> bool {
        let mut worked = false;
        loop {
            let job = self.inner.microtasks.lock().pop_front();
            match job {
                Some(job) => {
                    self.run_job(job);
                    worked = true;
                }
                None => return worked,
            }
        }
    }

    fn pop_macrotask(&self) -> Option<Job> {
        let mut queue = self.inner.macrotasks.lock();
        while let Some(job) = queue.pop_front() {
            if let Job::Check { cancelled, .. } = &job {
                if cancelled.load(Ordering::Acquire) {
                    continue;
                }
            }
            return Some(job);
        }
        None
    }

    fn run_job(&self, job: Job) {
        match job {
            Job::Callback { resource, run } => {
                let async_id = resource.async_id();
                self.inner.exec_stack.lock().push(resource);
                self.inner.hooks.before(async_id);
                run();
                self.inner.hooks.after(async_id);
                self.inner.exec_stack.lock().pop();
            }
            Job::Check { run, .. } => run(),
        }
    }

    /// Announces a new resource through the init hook. Returns the resource
    /// and the fault raised by the hook, if any; the caller must then fail
    /// the operation that requested the resource.
    pub(crate) fn create_resource(
        &self,
        kind: ResourceKind,
        trigger: Option<u64>,
        frame: Option<&'static Location<'static>>,
    ) -> (Resource, Option<Fault>) {
        let resource = Resource::allocate(kind, frame);
        let _guard = self.enter();
        let trigger_id = trigger.unwrap_or_else(|| self.execution_async_id());
        let fault = self
            .inner
            .hooks
            .init(resource.async_id(), kind, trigger_id, &resource)
            .err();
        (resource, fault)
    }

    pub(crate) fn dispatch_resolve(&self, async_id: u64) -> Result<(), Fault> {
        let _guard = self.enter();
        self.inner.hooks.promise_resolve(async_id)
    }

    pub(crate) fn enqueue_reaction(&self, resource: Resource, run: Box<dyn FnOnce()>) {
        self.inner
            .microtasks
            .lock()
            .push_back(Job::Callback { resource, run });
    }

    fn enqueue_callback(&self, resource: Resource, run: Box<dyn FnOnce()>) {
        self.inner
            .macrotasks
            .lock()
            .push_back(Job::Callback { resource, run });
    }

    /// Schedules an uninstrumented, cancellable one-shot at macrotask
    /// priority. The watchdog's stall probe rides on this so its own
    /// scheduling never appears in the graph it inspects.
    pub(crate) fn schedule_check(&self, run: impl FnOnce() + 'static) -> CheckHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.inner.macrotasks.lock().push_back(Job::Check {
            cancelled: Arc::clone(&cancelled),
            run: Box::new(run),
        });
        CheckHandle { cancelled }
    }

    fn schedule(
        &self,
        kind: ResourceKind,
        frame: &'static Location<'static>,
        run: Box<dyn FnOnce()>,
    ) -> Resource {
        let (resource, fault) = self.create_resource(kind, None, Some(frame));
        // A faulting init means the operation fails synchronously: the
        // callback is never scheduled.
        if fault.is_none() {
            self.enqueue_callback(resource.clone(), run);
        }
        resource
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("root", &self.inner.root.async_id())
            .field("quiescent", &self.is_quiescent())
            .finish()
    }
}

/// Schedules `f` to run in the next turns of the current loop, backed by an
/// `Immediate` resource.
///
/// # Panics
///
/// Panics when no event loop is in scope.
#[track_caller]
pub fn set_immediate(f: impl FnOnce() + 'static) -> Resource {
    EventLoop::current().schedule(ResourceKind::Immediate, Location::caller(), Box::new(f))
}

/// Schedules `f` as a simulated I/O completion, backed by an `IO` resource.
/// Unlike promises, an outstanding `IO` resource counts as real asynchronous
/// work for stall detection.
///
/// # Panics
///
/// Panics when no event loop is in scope.
#[track_caller]
pub fn schedule_io(f: impl FnOnce() + 'static) -> Resource {
    EventLoop::current().schedule(ResourceKind::Io, Location::caller(), Box::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn immediates_run_in_fifo_order_one_per_turn() {
        let rt = EventLoop::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        rt.scope(|| {
            for i in 0..3 {
                let order = Rc::clone(&order);
                set_immediate(move || order.borrow_mut().push(i));
            }
        });
        assert!(!rt.is_quiescent());
        assert!(rt.turn());
        assert_eq!(*order.borrow(), vec![0]);
        let turns = rt.run();
        assert_eq!(turns, 2);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert!(rt.is_quiescent());
    }

    #[test]
    fn nested_immediates_run_on_later_turns() {
        let rt = EventLoop::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        rt.scope(|| {
            let order2 = Rc::clone(&order);
            set_immediate(move || {
                order2.borrow_mut().push("outer");
                let order3 = Rc::clone(&order2);
                set_immediate(move || order3.borrow_mut().push("inner"));
            });
        });
        rt.run();
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn execution_context_follows_the_running_callback() {
        let rt = EventLoop::new();
        let root_id = rt.scope(|| EventLoop::current().execution_async_id());
        let seen = Rc::new(RefCell::new(None));
        let seen2 = Rc::clone(&seen);
        let resource = rt.scope(|| {
            set_immediate(move || {
                *seen2.borrow_mut() = Some(EventLoop::current().execution_async_id());
            })
        });
        rt.run();
        assert_eq!(*seen.borrow(), Some(resource.async_id()));
        assert_eq!(rt.scope(|| EventLoop::current().execution_async_id()), root_id);
    }

    #[test]
    fn cancelled_checks_never_run() {
        let rt = EventLoop::new();
        let ran = Rc::new(RefCell::new(false));
        let ran2 = Rc::clone(&ran);
        let handle = rt.schedule_check(move || *ran2.borrow_mut() = true);
        handle.cancel();
        rt.run();
        assert!(!*ran.borrow());
        assert!(rt.is_quiescent());
    }
}
