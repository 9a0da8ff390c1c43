//! Fiber isolation for a cooperative single-threaded event loop.
//!
//! A *fiber* is a logically isolated asynchronous computation: a function
//! returning a deferred value, together with every asynchronous resource it
//! transitively creates. This crate maintains a shadow graph of the
//! resources the embedded loop reports through its lifecycle hooks, labels
//! each node with its owning fiber, and supervises every fiber with a
//! watchdog enforcing three contracts:
//!
//! - a fiber may not await a resource produced by a *different* fiber;
//! - a fiber may not await a resource produced in the *parent execution
//!   context before the fiber started*;
//! - a fiber may not stall forever on a deferred value no asynchronous work
//!   will ever wake.
//!
//! Violations reject the fiber's wrapped result with a typed [`Fault`].
//! Leakage detection is accidental-sharing tooling, not a security sandbox.
//!
//! # Example
//!
//! ```
//! use fiber_pulse::{enable, disable, fiber, EventLoop, FaultCode, Promise};
//!
//! let rt = EventLoop::new();
//! let handle = rt.scope(|| {
//!     enable();
//!     // A deferred value owned by the outer context.
//!     let (outer_promise, _keep) = Promise::<i32>::pending();
//!     // The fiber awaits it: that is a parent-trigger violation.
//!     fiber(move || outer_promise.then(|v| v))
//! });
//! rt.run();
//! rt.scope(|| disable());
//!
//! let fault = handle.result.try_result().unwrap().unwrap_err();
//! assert_eq!(fault.code(), FaultCode::ParentAsyncTrigger);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

/// Typed fiber faults.
pub mod fault;
/// Fiber records and the public isolation surface.
pub mod fiber;
/// Lifecycle hook trait, registry, and the graph adapter.
pub mod hooks;
/// Counters for isolation behavior.
pub mod metrics;
/// Shadow nodes of the async resource graph.
pub mod node;
/// The embedded cooperative event loop, promises, and cancellation.
pub mod runtime;

pub(crate) mod watchdog;

pub use self::fault::{Fault, FaultCode, TraceEdge, TraceHop};
pub use self::fiber::{
    current_fiber, disable, enable, fiber, fiber_node, fiber_with, Fiber, FiberHandle,
    FiberOptions,
};
pub use self::hooks::{HookRegistry, LifecycleHooks};
pub use self::metrics::{IsolationMetrics, MetricsSnapshot};
pub use self::node::{flags, AsyncNode};
pub use self::runtime::{
    schedule_io, set_immediate, CancelSignal, CancelSource, EventLoop, Promise, Resolver,
    Resource, ResourceKind, SettleState,
};
