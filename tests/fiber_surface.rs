//! Public surface behavior: enable/disable, the fiber stack, node lookup,
//! and graph accounting.

use fiber_pulse::{
    current_fiber, disable, enable, fiber, fiber_node, set_immediate, EventLoop, Promise,
    ResourceKind,
};

#[test]
fn nodes_inherit_the_active_fiber_and_keep_it() {
    let rt = EventLoop::new();
    rt.scope(|| {
        let outer = enable();
        let (p, resolver) = Promise::<i32>::pending();
        let node = fiber_node(p.resource()).expect("promise is shadowed");
        assert_eq!(node.kind(), ResourceKind::Promise);
        assert_eq!(node.fiber_id(), outer.fiber_id());

        // Launching and finishing another fiber never re-stamps the node.
        let handle = fiber(|| Promise::resolved(0));
        assert_eq!(node.fiber_id(), outer.fiber_id());
        assert_ne!(handle.fiber.fiber_id(), outer.fiber_id());

        resolver.resolve(1);
        assert_eq!(node.fiber_id(), outer.fiber_id());
        disable();
    });
    rt.run();
}

#[test]
fn nothing_is_shadowed_while_no_fiber_is_enabled() {
    let rt = EventLoop::new();
    rt.scope(|| {
        let (p, _resolver) = Promise::<i32>::pending();
        assert!(fiber_node(p.resource()).is_none());
        assert!(current_fiber().is_none());
        assert!(disable().is_none());
    });
}

#[test]
fn pending_tasks_counts_unfinalized_descendants() {
    let rt = EventLoop::new();
    let handle = rt.scope(|| {
        enable();
        let handle = fiber(|| {
            let (p, resolver) = Promise::<i32>::pending();
            set_immediate(move || resolver.resolve(4));
            p
        });
        handle
    });

    // The body's promise, the immediate, and the wrapped result are all
    // unfinalized right after launch.
    assert_eq!(handle.fiber.pending_tasks(), 3);
    assert_eq!(handle.fiber.execution_targets().len(), 3);

    rt.run();
    rt.scope(|| disable());

    assert_eq!(handle.result.try_result().unwrap().unwrap(), 4);
    assert_eq!(handle.fiber.pending_tasks(), 0);
}

#[test]
fn nested_fibers_record_their_parent_chain() {
    let rt = EventLoop::new();
    rt.scope(|| {
        let root_fiber = enable();
        let outer = fiber(|| Promise::resolved(0));
        assert_eq!(
            outer.fiber.parent().map(|p| p.fiber_id()),
            Some(root_fiber.fiber_id())
        );

        // While a fiber body runs, it is the active fiber; a fiber launched
        // inside it records it as parent.
        let inner_parent = std::cell::Cell::new(0);
        let inner_parent_ref = &inner_parent;
        let mid = fiber(|| {
            let inner = fiber(|| Promise::resolved(0));
            inner_parent_ref.set(inner.fiber.parent().map_or(0, |p| p.fiber_id()));
            inner.result
        });
        assert_eq!(inner_parent.get(), mid.fiber.fiber_id());
        disable();
    });
    rt.run();
}

#[test]
fn disable_restamps_the_root_to_the_remaining_fiber() {
    let rt = EventLoop::new();
    rt.scope(|| {
        let outer = enable();
        let root = outer.root();
        assert_eq!(root.fiber_id(), outer.fiber_id());

        let handle = fiber(|| Promise::resolved(0));
        // The launched fiber deactivated itself already.
        assert!(!handle.fiber.is_active());
        assert_eq!(root.fiber_id(), outer.fiber_id());

        disable();
        assert_eq!(root.fiber_id(), 0);
    });
    rt.run();
}

#[test]
fn loops_are_isolated_per_instance() {
    let rt_a = EventLoop::new();
    let rt_b = EventLoop::new();
    let id_a = rt_a.scope(|| EventLoop::current().execution_async_id());
    let id_b = rt_b.scope(|| EventLoop::current().execution_async_id());
    assert_ne!(id_a, id_b);
}
