//! Shadow nodes of the async resource graph.
//!
//! One [`AsyncNode`] exists per live asynchronous resource the host loop
//! reports. Nodes hold identity, monotone lifecycle flags, the owning fiber
//! id (inherited from the creator at init), the two origin edges, the two
//! target maps, and at most one attached observer. Edges point strongly
//! downward (`execution_targets`) and weakly upward (`execution_origin`,
//! `trigger_origin`) and weakly across (`trigger_targets`), so the graph
//! cannot keep itself alive through trigger cycles.

use crate::fault::Fault;
use crate::metrics;
use crate::runtime::{Resource, ResourceKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Lifecycle flag bits of a node.
pub mod flags {
    /// The node has been created.
    pub const INIT: u8 = 1 << 0;
    /// The node's callback has started at least once.
    pub const PRE_EXECUTION: u8 = 1 << 1;
    /// The node's callback has completed.
    pub const POST_EXECUTION: u8 = 1 << 2;
    /// The node's deferred value has resolved.
    pub const RESOLVED: u8 = 1 << 3;
    /// The node was reached by an abort taint.
    pub const ABORTED: u8 = 1 << 4;
    /// A node is finalized once its body completed or its value resolved.
    pub const FINALIZED: u8 = POST_EXECUTION | RESOLVED;
}

/// Per-fiber observer attached to nodes the watchdog supervises.
///
/// `on_init` and `on_resolve` may fault; the fault unwinds through the hook
/// dispatch so the violating operation fails synchronously.
pub(crate) trait AsyncObserver {
    fn on_init(&self, node: &Arc<AsyncNode>) -> Result<(), Fault>;
    fn on_before(&self, node: &Arc<AsyncNode>);
    fn on_after(&self, node: &Arc<AsyncNode>);
    fn on_resolve(&self, node: &Arc<AsyncNode>) -> Result<(), Fault>;
}

#[derive(Default)]
struct NodeLinks {
    execution_targets: BTreeMap<u64, Arc<AsyncNode>>,
    trigger_targets: BTreeMap<u64, Weak<AsyncNode>>,
}

/// Shadow node of one asynchronous resource.
pub struct AsyncNode {
    async_id: u64,
    kind: ResourceKind,
    frame: Option<&'static Location<'static>>,
    fiber_id: AtomicU64,
    active: AtomicBool,
    flags: AtomicU8,
    execution_origin: Option<Weak<AsyncNode>>,
    trigger_origin: Option<Weak<AsyncNode>>,
    links: Mutex<NodeLinks>,
    observer: Mutex<Option<Arc<dyn AsyncObserver>>>,
}

impl AsyncNode {
    /// Creates the root node for an execution context that has no shadow
    /// yet, and publishes it through the resource's sentinel slot.
    pub(crate) fn root(resource: &Resource, fiber_id: u64) -> Arc<Self> {
        let node = Arc::new(Self {
            async_id: resource.async_id(),
            kind: resource.kind(),
            frame: resource.frame(),
            fiber_id: AtomicU64::new(fiber_id),
            active: AtomicBool::new(true),
            flags: AtomicU8::new(flags::INIT),
            execution_origin: None,
            trigger_origin: None,
            links: Mutex::new(NodeLinks::default()),
            observer: Mutex::new(None),
        });
        resource.attach_sentinel(Arc::clone(&node));
        metrics::global().node_created();
        node
    }

    /// Runtime-assigned resource id.
    #[must_use]
    pub fn async_id(&self) -> u64 {
        self.async_id
    }

    /// Resource category reported by the host loop.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Call site that created the resource, when captured.
    #[must_use]
    pub fn frame(&self) -> Option<&'static Location<'static>> {
        self.frame
    }

    /// Owning fiber id. Inherited from the creator at init; constant for
    /// all nodes except fiber roots, which are re-stamped on fiber
    /// activation.
    #[must_use]
    pub fn fiber_id(&self) -> u64 {
        self.fiber_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_fiber_id(&self, fiber_id: u64) {
        self.fiber_id.store(fiber_id, Ordering::Release);
    }

    /// Whether the node reacts to lifecycle events.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Current flag bits, see [`flags`].
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    fn or_flags(&self, bits: u8) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    /// Whether the node completed its body or resolved its value.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.flags() & flags::FINALIZED != 0
    }

    /// Whether an abort taint reached this node.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.flags() & flags::ABORTED != 0
    }

    /// The node whose execution context was current at creation.
    #[must_use]
    pub fn execution_origin(&self) -> Option<Arc<AsyncNode>> {
        self.execution_origin.as_ref().and_then(Weak::upgrade)
    }

    /// The node whose completion schedules this one.
    #[must_use]
    pub fn trigger_origin(&self) -> Option<Arc<AsyncNode>> {
        self.trigger_origin.as_ref().and_then(Weak::upgrade)
    }

    /// Direct children created in this node's execution context.
    #[must_use]
    pub fn execution_targets(&self) -> Vec<Arc<AsyncNode>> {
        self.links.lock().execution_targets.values().cloned().collect()
    }

    pub(crate) fn last_execution_target(&self) -> Option<Arc<AsyncNode>> {
        self.links.lock().execution_targets.values().next_back().cloned()
    }

    pub(crate) fn set_observer(&self, observer: Arc<dyn AsyncObserver>) {
        *self.observer.lock() = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn AsyncObserver>> {
        self.observer.lock().clone()
    }

    fn clear_observer(&self) {
        self.observer.lock().take();
    }

    /// Creation handler: builds the shadow of a resource created while this
    /// node's execution context was current.
    ///
    /// The child inherits this node's fiber id, the execution edge is always
    /// wired, and the trigger edge only when the runtime reported a trigger
    /// distinct from the resource itself. The creator's observer is notified
    /// last, so a faulting observer sees fully wired edges.
    pub(crate) fn handle_create(
        self: &Arc<Self>,
        async_id: u64,
        kind: ResourceKind,
        trigger_id: u64,
        resource: &Resource,
    ) -> Result<Arc<AsyncNode>, Fault> {
        let trigger = if trigger_id == async_id {
            None
        } else {
            self.locate(trigger_id)
        };
        let node = Arc::new(AsyncNode {
            async_id,
            kind,
            frame: resource.frame(),
            fiber_id: AtomicU64::new(self.fiber_id()),
            active: AtomicBool::new(true),
            flags: AtomicU8::new(flags::INIT),
            execution_origin: Some(Arc::downgrade(self)),
            trigger_origin: trigger.as_ref().map(Arc::downgrade),
            links: Mutex::new(NodeLinks::default()),
            observer: Mutex::new(None),
        });
        resource.attach_sentinel(Arc::clone(&node));
        self.links
            .lock()
            .execution_targets
            .insert(async_id, Arc::clone(&node));
        if let Some(t) = &trigger {
            t.links
                .lock()
                .trigger_targets
                .insert(async_id, Arc::downgrade(&node));
        }
        metrics::global().node_created();

        #[cfg(feature = "tracing")]
        tracing::trace!(
            async_id,
            kind = %kind,
            trigger_id,
            fiber_id = node.fiber_id(),
            "resource shadowed"
        );

        if self.is_active() {
            if let Some(obs) = self.observer() {
                obs.on_init(&node)?;
            }
        }
        Ok(node)
    }

    /// Finds the node for `async_id` in the current execution chain: this
    /// node, its direct execution targets, then the same check on each
    /// execution origin upward. The host loop delivers events inside the
    /// creator's context or a descendant of it, so the search is bounded and
    /// a global id index is unnecessary.
    pub(crate) fn locate(self: &Arc<Self>, async_id: u64) -> Option<Arc<AsyncNode>> {
        let mut cur = Arc::clone(self);
        loop {
            if cur.async_id == async_id {
                return Some(cur);
            }
            if let Some(hit) = cur.links.lock().execution_targets.get(&async_id) {
                return Some(Arc::clone(hit));
            }
            cur = cur.execution_origin()?;
        }
    }

    pub(crate) fn handle_before(self: &Arc<Self>) {
        if !self.is_active() {
            return;
        }
        self.or_flags(flags::PRE_EXECUTION);
        if let Some(obs) = self.observer() {
            obs.on_before(self);
        }
    }

    pub(crate) fn handle_after(self: &Arc<Self>) {
        if !self.is_active() {
            return;
        }
        self.or_flags(flags::POST_EXECUTION);
        let obs = self.observer();
        // A finalized node is of no further interest to its observer.
        self.clear_observer();
        if let Some(obs) = obs {
            obs.on_after(self);
        }
    }

    pub(crate) fn handle_resolve(self: &Arc<Self>) -> Result<(), Fault> {
        if !self.is_active() {
            return Ok(());
        }
        self.or_flags(flags::RESOLVED);
        let obs = self.observer();
        self.clear_observer();
        if let Some(obs) = obs {
            obs.on_resolve(self)?;
        }
        Ok(())
    }

    /// Visits every descendant of this node owned by `fiber_id`, following
    /// execution targets only. The receiver itself is not visited.
    pub(crate) fn walk_owned(
        self: &Arc<Self>,
        fiber_id: u64,
        visit: &mut impl FnMut(&Arc<AsyncNode>),
    ) {
        let children: Vec<Arc<AsyncNode>> = {
            let links = self.links.lock();
            links
                .execution_targets
                .values()
                .filter(|c| c.fiber_id() == fiber_id)
                .cloned()
                .collect()
        };
        for child in children {
            visit(&child);
            child.walk_owned(fiber_id, visit);
        }
    }
}

impl fmt::Debug for AsyncNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncNode")
            .field("async_id", &self.async_id)
            .field("kind", &self.kind)
            .field("fiber_id", &self.fiber_id())
            .field("flags", &format_args!("{:#07b}", self.flags()))
            .field("active", &self.is_active())
            .finish()
    }
}

/// Recursively ORs `set` into every node reachable from `node` over
/// execution-target and trigger-target edges.
///
/// A node already carrying any bit of `mask` stops the recursion there, as
/// does a node already carrying all of `set`. The second guard makes the
/// walk terminate on cyclic trigger graphs.
pub(crate) fn taint(node: &Arc<AsyncNode>, mask: u8, set: u8) {
    let current = node.flags();
    if current & mask != 0 {
        return;
    }
    if current & set == set {
        return;
    }
    node.or_flags(set);
    metrics::global().node_tainted();

    let (exec, trig): (Vec<Arc<AsyncNode>>, Vec<Arc<AsyncNode>>) = {
        let links = node.links.lock();
        (
            links.execution_targets.values().cloned().collect(),
            links
                .trigger_targets
                .values()
                .filter_map(Weak::upgrade)
                .collect(),
        )
    };
    for child in exec.iter().chain(trig.iter()) {
        taint(child, mask, set);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hand-built graph pieces for unit tests.

    use super::*;

    /// Builds a node wired into the given origins' target maps.
    pub(crate) fn build(
        async_id: u64,
        kind: ResourceKind,
        fiber_id: u64,
        execution_origin: Option<&Arc<AsyncNode>>,
        trigger_origin: Option<&Arc<AsyncNode>>,
    ) -> Arc<AsyncNode> {
        let node = Arc::new(AsyncNode {
            async_id,
            kind,
            frame: None,
            fiber_id: AtomicU64::new(fiber_id),
            active: AtomicBool::new(true),
            flags: AtomicU8::new(flags::INIT),
            execution_origin: execution_origin.map(Arc::downgrade),
            trigger_origin: trigger_origin.map(Arc::downgrade),
            links: Mutex::new(NodeLinks::default()),
            observer: Mutex::new(None),
        });
        if let Some(parent) = execution_origin {
            parent
                .links
                .lock()
                .execution_targets
                .insert(async_id, Arc::clone(&node));
        }
        if let Some(trigger) = trigger_origin {
            trigger
                .links
                .lock()
                .trigger_targets
                .insert(async_id, Arc::downgrade(&node));
        }
        node
    }

    /// Adds a trigger-target edge after the fact, for cyclic shapes.
    pub(crate) fn wire_trigger(from: &Arc<AsyncNode>, to: &Arc<AsyncNode>) {
        from.links
            .lock()
            .trigger_targets
            .insert(to.async_id(), Arc::downgrade(to));
    }

    /// ORs raw flag bits into a node.
    pub(crate) fn mark(node: &Arc<AsyncNode>, bits: u8) {
        node.or_flags(bits);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{build, mark, wire_trigger};
    use super::*;
    use proptest::prelude::*;

    fn bare(async_id: u64, kind: ResourceKind, fiber_id: u64) -> Arc<AsyncNode> {
        build(async_id, kind, fiber_id, None, None)
    }

    fn adopt(parent: &Arc<AsyncNode>, async_id: u64, kind: ResourceKind) -> Arc<AsyncNode> {
        build(async_id, kind, parent.fiber_id(), Some(parent), None)
    }

    #[test]
    fn finalized_is_either_post_execution_or_resolved() {
        let n = bare(1, ResourceKind::Promise, 0);
        assert!(!n.is_finalized());
        mark(&n, flags::RESOLVED);
        assert!(n.is_finalized());

        let m = bare(2, ResourceKind::Immediate, 0);
        mark(&m, flags::POST_EXECUTION);
        assert!(m.is_finalized());
    }

    #[test]
    fn locate_walks_the_execution_chain() {
        let root = bare(1, ResourceKind::Root, 0);
        let a = adopt(&root, 2, ResourceKind::Promise);
        let b = adopt(&a, 3, ResourceKind::Promise);
        let sibling = adopt(&root, 4, ResourceKind::Immediate);

        assert_eq!(b.locate(3).map(|n| n.async_id()), Some(3));
        assert_eq!(b.locate(2).map(|n| n.async_id()), Some(2));
        // Sibling of an ancestor: found through the ancestor's targets.
        assert_eq!(b.locate(4).map(|n| n.async_id()), Some(4));
        assert_eq!(b.locate(99).map(|n| n.async_id()), None);
    }

    #[test]
    fn taint_skips_finalized_nodes_and_their_subtrees() {
        let root = bare(1, ResourceKind::Root, 0);
        let live = adopt(&root, 2, ResourceKind::Promise);
        let done = adopt(&root, 3, ResourceKind::Promise);
        let shielded = adopt(&done, 4, ResourceKind::Promise);
        mark(&done, flags::RESOLVED);

        taint(&root, flags::FINALIZED, flags::ABORTED);

        assert!(root.is_aborted());
        assert!(live.is_aborted());
        assert!(!done.is_aborted());
        assert!(!shielded.is_aborted());
    }

    #[test]
    fn taint_terminates_on_trigger_cycles() {
        let root = bare(1, ResourceKind::Root, 0);
        let a = adopt(&root, 2, ResourceKind::Promise);
        let b = adopt(&root, 3, ResourceKind::Promise);
        wire_trigger(&a, &b);
        wire_trigger(&b, &a);

        taint(&root, flags::FINALIZED, flags::ABORTED);

        assert!(a.is_aborted());
        assert!(b.is_aborted());
    }

    #[test]
    fn walk_owned_is_restricted_to_the_fiber() {
        let root = bare(1, ResourceKind::Root, 7);
        let own = adopt(&root, 2, ResourceKind::Promise);
        let own_child = adopt(&own, 3, ResourceKind::Promise);
        let foreign = adopt(&root, 4, ResourceKind::Promise);
        foreign.set_fiber_id(8);
        // Children under a foreign node are unreachable even if re-stamped.
        let unreachable = adopt(&foreign, 5, ResourceKind::Promise);
        unreachable.set_fiber_id(7);

        let mut seen = Vec::new();
        root.walk_owned(7, &mut |n| seen.push(n.async_id()));
        assert_eq!(seen, vec![2, 3]);
        let _ = own_child;
    }

    proptest! {
        // Abort taint reaches every unfinalized node of a random tree and
        // no finalized one, regardless of shape.
        #[test]
        fn taint_covers_exactly_the_unfinalized(
            shape in proptest::collection::vec((0usize..8, prop::bool::ANY), 1..32)
        ) {
            let root = bare(0, ResourceKind::Root, 0);
            let mut nodes = vec![Arc::clone(&root)];
            let mut finalized = vec![false];
            for (i, (parent, done)) in shape.iter().enumerate() {
                let parent_idx = parent % nodes.len();
                let parent_node = Arc::clone(&nodes[parent_idx]);
                let child = adopt(&parent_node, (i as u64) + 1, ResourceKind::Promise);
                if *done {
                    mark(&child, flags::RESOLVED);
                }
                nodes.push(child);
                finalized.push(*done);
            }

            taint(&root, flags::FINALIZED, flags::ABORTED);

            for (idx, node) in nodes.iter().enumerate() {
                // A node below a finalized ancestor is shielded from the
                // taint along the tree edge.
                let mut shielded = finalized[idx];
                let mut cur = node.execution_origin();
                while let Some(n) = cur {
                    let i = nodes.iter().position(|m| Arc::ptr_eq(m, &n)).unwrap();
                    if finalized[i] {
                        shielded = true;
                        break;
                    }
                    cur = n.execution_origin();
                }
                prop_assert_eq!(node.is_aborted(), !shielded);
            }
        }
    }
}
