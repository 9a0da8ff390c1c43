//! Lifecycle hooks connecting the host loop to the shadow graph.
//!
//! The loop owns a [`HookRegistry`]; the isolation layer arms it with the
//! [`GraphAdapter`] when the first fiber activates and disarms it when the
//! fiber stack empties. Every callback runs under a thread-local reentrancy
//! guard so resource creations performed while a hook is executing cannot
//! recurse into `init`.

use crate::fault::Fault;
use crate::node::AsyncNode;
use crate::runtime::{EventLoop, Resource, ResourceKind};
use parking_lot::RwLock;
use std::cell::Cell;
use std::sync::Arc;

/// Callbacks delivered by the host loop for every instrumented resource.
///
/// `init` and `promise_resolve` may return a [`Fault`]; the loop then fails
/// the operation that produced the event synchronously, which is this
/// crate's rendition of throwing out of a hook callback.
pub trait LifecycleHooks {
    /// A resource was created in the current execution context.
    fn init(
        &self,
        async_id: u64,
        kind: ResourceKind,
        trigger_id: u64,
        resource: &Resource,
    ) -> Result<(), Fault>;

    /// The resource's callback is about to run.
    fn before(&self, async_id: u64);

    /// The resource's callback has returned.
    fn after(&self, async_id: u64);

    /// The resource's deferred value resolved.
    fn promise_resolve(&self, async_id: u64) -> Result<(), Fault>;
}

/// Install point for a single process-wide hook implementation.
///
/// Dispatch methods forward when armed and are no-ops otherwise.
pub struct HookRegistry {
    hooks: RwLock<Option<Arc<dyn LifecycleHooks>>>,
}

impl HookRegistry {
    /// Creates an empty, disarmed registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(None),
        }
    }

    /// Arms the registry, returning the previously installed hooks.
    pub fn install(&self, hooks: Arc<dyn LifecycleHooks>) -> Option<Arc<dyn LifecycleHooks>> {
        self.hooks.write().replace(hooks)
    }

    /// Disarms the registry, returning the previously installed hooks.
    pub fn clear(&self) -> Option<Arc<dyn LifecycleHooks>> {
        self.hooks.write().take()
    }

    /// Whether hooks are currently installed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.hooks.read().is_some()
    }

    fn current(&self) -> Option<Arc<dyn LifecycleHooks>> {
        self.hooks.read().clone()
    }

    pub(crate) fn init(
        &self,
        async_id: u64,
        kind: ResourceKind,
        trigger_id: u64,
        resource: &Resource,
    ) -> Result<(), Fault> {
        match self.current() {
            Some(hooks) => {
                crate::metrics::global().event_dispatched();
                hooks.init(async_id, kind, trigger_id, resource)
            }
            None => Ok(()),
        }
    }

    pub(crate) fn before(&self, async_id: u64) {
        if let Some(hooks) = self.current() {
            crate::metrics::global().event_dispatched();
            hooks.before(async_id);
        }
    }

    pub(crate) fn after(&self, async_id: u64) {
        if let Some(hooks) = self.current() {
            crate::metrics::global().event_dispatched();
            hooks.after(async_id);
        }
    }

    pub(crate) fn promise_resolve(&self, async_id: u64) -> Result<(), Fault> {
        match self.current() {
            Some(hooks) => {
                crate::metrics::global().event_dispatched();
                hooks.promise_resolve(async_id)
            }
            None => Ok(()),
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static HOOK_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Whether a hook callback is executing on this thread.
pub(crate) fn hook_active() -> bool {
    HOOK_ACTIVE.with(Cell::get)
}

struct HookGuard {
    prev: bool,
}

impl HookGuard {
    fn enter() -> Self {
        let prev = HOOK_ACTIVE.with(|f| f.replace(true));
        Self { prev }
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        HOOK_ACTIVE.with(|f| f.set(prev));
    }
}

/// The one [`LifecycleHooks`] implementation: translates loop callbacks into
/// method invocations on the shadow graph.
pub(crate) struct GraphAdapter;

impl GraphAdapter {
    /// Node of the current execution context, via the resource sentinel.
    fn execution_node() -> Option<Arc<AsyncNode>> {
        let rt = EventLoop::try_current()?;
        rt.execution_resource().sentinel()
    }

    /// Bounded search for `async_id` starting at the current execution
    /// context.
    fn find(async_id: u64) -> Option<Arc<AsyncNode>> {
        Self::execution_node()?.locate(async_id)
    }
}

impl LifecycleHooks for GraphAdapter {
    fn init(
        &self,
        async_id: u64,
        kind: ResourceKind,
        trigger_id: u64,
        resource: &Resource,
    ) -> Result<(), Fault> {
        // Creations performed by the adapter or an observer while a hook is
        // running must not recurse into the graph.
        if hook_active() {
            return Ok(());
        }
        let _guard = HookGuard::enter();
        let Some(creator) = Self::execution_node() else {
            // No shadow for the current context: the event predates arming.
            return Ok(());
        };
        creator
            .handle_create(async_id, kind, trigger_id, resource)
            .map(|_| ())
    }

    fn before(&self, async_id: u64) {
        let _guard = HookGuard::enter();
        if let Some(node) = Self::find(async_id) {
            node.handle_before();
        }
    }

    fn after(&self, async_id: u64) {
        let _guard = HookGuard::enter();
        if let Some(node) = Self::find(async_id) {
            node.handle_after();
        }
    }

    fn promise_resolve(&self, async_id: u64) -> Result<(), Fault> {
        let _guard = HookGuard::enter();
        match Self::find(async_id) {
            Some(node) => node.handle_resolve(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct CountingHooks {
        inits: Rc<RefCell<u32>>,
        resolves: Rc<RefCell<u32>>,
    }

    impl LifecycleHooks for CountingHooks {
        fn init(
            &self,
            _async_id: u64,
            _kind: ResourceKind,
            _trigger_id: u64,
            _resource: &Resource,
        ) -> Result<(), Fault> {
            *self.inits.borrow_mut() += 1;
            Ok(())
        }

        fn before(&self, _async_id: u64) {}

        fn after(&self, _async_id: u64) {}

        fn promise_resolve(&self, _async_id: u64) -> Result<(), Fault> {
            *self.resolves.borrow_mut() += 1;
            Ok(())
        }
    }

    #[test]
    fn registry_forwards_only_while_armed() {
        let registry = HookRegistry::new();
        assert!(!registry.is_armed());

        let inits = Rc::new(RefCell::new(0));
        let resolves = Rc::new(RefCell::new(0));
        let hooks = Arc::new(CountingHooks {
            inits: Rc::clone(&inits),
            resolves: Rc::clone(&resolves),
        });

        let resource = Resource::detached(ResourceKind::Promise);
        assert!(registry
            .init(resource.async_id(), ResourceKind::Promise, 0, &resource)
            .is_ok());
        assert_eq!(*inits.borrow(), 0);

        assert!(registry.install(hooks).is_none());
        assert!(registry.is_armed());
        registry
            .init(resource.async_id(), ResourceKind::Promise, 0, &resource)
            .unwrap();
        registry.promise_resolve(resource.async_id()).unwrap();
        assert_eq!(*inits.borrow(), 1);
        assert_eq!(*resolves.borrow(), 1);

        assert!(registry.clear().is_some());
        assert!(registry.clear().is_none());
        registry.promise_resolve(resource.async_id()).unwrap();
        assert_eq!(*resolves.borrow(), 1);
    }

    #[test]
    fn reentrancy_guard_nests_and_restores() {
        assert!(!hook_active());
        {
            let _outer = HookGuard::enter();
            assert!(hook_active());
            {
                let _inner = HookGuard::enter();
                assert!(hook_active());
            }
            assert!(hook_active());
        }
        assert!(!hook_active());
    }
}
