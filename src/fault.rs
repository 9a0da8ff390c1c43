//! Typed fiber faults.
//!
//! Every contract violation the watchdog can detect collapses into a single
//! error type, [`Fault`], tagged with a [`FaultCode`]. The taxonomy is
//! closed: there are exactly five codes and nothing is ever retried or
//! recovered locally. A fault carries the offending node, the owning fiber
//! when it is still alive, and a bounded diagnostic trace built by walking
//! the node's execution-origin chain plus its trigger origin.

use crate::fiber::Fiber;
use crate::node::AsyncNode;
use crate::runtime::ResourceKind;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Maximum execution-origin hops recorded in a fault trace.
const MAX_TRACE_DEPTH: usize = 16;

/// Classification of a fiber fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// The fiber awaited a resource triggered by an unrelated fiber.
    ForeignAsyncTrigger,
    /// The fiber awaited a resource triggered by its parent context before
    /// the fiber started.
    ParentAsyncTrigger,
    /// The fiber observed a resource whose trigger was aborted by a
    /// different fiber.
    ForeignAsyncAborted,
    /// The fiber's own graph was aborted through its cancellation signal.
    FiberAborted,
    /// The fiber is waiting on deferred values with no asynchronous work
    /// outstanding to ever wake them.
    FiberStall,
}

impl FaultCode {
    /// Stable string form of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ForeignAsyncTrigger => "FOREIGN_ASYNC_TRIGGER",
            Self::ParentAsyncTrigger => "PARENT_ASYNC_TRIGGER",
            Self::ForeignAsyncAborted => "FOREIGN_ASYNC_ABORTED",
            Self::FiberAborted => "FIBER_ABORTED",
            Self::FiberStall => "FIBER_STALL",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which edge a trace hop followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEdge {
    /// Parent execution context at creation time.
    Execution,
    /// The resource whose completion schedules this one.
    Trigger,
}

/// One hop of a fault trace.
#[derive(Clone)]
pub struct TraceHop {
    /// Edge kind that led to this hop.
    pub edge: TraceEdge,
    /// Resource id of the node at this hop.
    pub async_id: u64,
    /// Resource category of the node at this hop.
    pub kind: ResourceKind,
    /// Fiber owning the node at this hop.
    pub fiber_id: u64,
    /// Call site that created the node, when captured.
    pub frame: Option<&'static Location<'static>>,
}

impl fmt::Debug for TraceHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}({}) fiber={}",
            self.edge, self.kind, self.async_id, self.fiber_id
        )
    }
}

struct FaultDetail {
    fiber: Option<Arc<Fiber>>,
    node: Option<Arc<AsyncNode>>,
    reason: Option<String>,
    trace: Vec<TraceHop>,
}

/// A fiber isolation fault.
///
/// Cheap to clone; the first fault raised against a fiber settles its
/// wrapped result and later faults are swallowed.
#[derive(Clone, thiserror::Error)]
#[error("{rendered}")]
pub struct Fault {
    code: FaultCode,
    fiber_id: u64,
    rendered: String,
    detail: Arc<FaultDetail>,
}

impl PartialEq for Fault {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.fiber_id == other.fiber_id && self.rendered == other.rendered
    }
}

impl Fault {
    pub(crate) fn new(
        code: FaultCode,
        fiber_id: u64,
        fiber: Option<Arc<Fiber>>,
        node: Option<&Arc<AsyncNode>>,
        reason: Option<String>,
    ) -> Self {
        let trace = node.map(build_trace).unwrap_or_default();
        let rendered = render(code, fiber_id, node, reason.as_deref(), &trace);
        Self {
            code,
            fiber_id,
            rendered,
            detail: Arc::new(FaultDetail {
                fiber,
                node: node.map(Arc::clone),
                reason,
                trace,
            }),
        }
    }

    /// The fault classification.
    #[must_use]
    pub fn code(&self) -> FaultCode {
        self.code
    }

    /// Id of the fiber the fault was raised against.
    #[must_use]
    pub fn fiber_id(&self) -> u64 {
        self.fiber_id
    }

    /// The faulted fiber, when it was still reachable at fault time.
    #[must_use]
    pub fn fiber(&self) -> Option<&Arc<Fiber>> {
        self.detail.fiber.as_ref()
    }

    /// The node the fault points at. Absent only when the graph had already
    /// been torn down.
    #[must_use]
    pub fn node(&self) -> Option<&Arc<AsyncNode>> {
        self.detail.node.as_ref()
    }

    /// Cancellation reason, for abort faults raised through a signal.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.detail.reason.as_deref()
    }

    /// Bounded origin trace of the offending node.
    #[must_use]
    pub fn trace(&self) -> &[TraceHop] {
        &self.detail.trace
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("code", &self.code)
            .field("fiber_id", &self.fiber_id)
            .field("node", &self.detail.node.as_ref().map(|n| n.async_id()))
            .field("reason", &self.detail.reason)
            .finish()
    }
}

fn render(
    code: FaultCode,
    fiber_id: u64,
    node: Option<&Arc<AsyncNode>>,
    reason: Option<&str>,
    trace: &[TraceHop],
) -> String {
    let mut msg = match (node, code) {
        (Some(n), FaultCode::ForeignAsyncTrigger) => format!(
            "FOREIGN_ASYNC_TRIGGER: fiber {fiber_id} awaited {}({}) triggered by another fiber",
            n.kind(),
            n.async_id()
        ),
        (Some(n), FaultCode::ParentAsyncTrigger) => format!(
            "PARENT_ASYNC_TRIGGER: fiber {fiber_id} awaited {}({}) created before the fiber started",
            n.kind(),
            n.async_id()
        ),
        (Some(n), FaultCode::ForeignAsyncAborted) => format!(
            "FOREIGN_ASYNC_ABORTED: fiber {fiber_id} observed {}({}) whose trigger was aborted elsewhere",
            n.kind(),
            n.async_id()
        ),
        (Some(n), FaultCode::FiberAborted) => format!(
            "FIBER_ABORTED: fiber {fiber_id} was aborted at {}({})",
            n.kind(),
            n.async_id()
        ),
        (Some(n), FaultCode::FiberStall) => format!(
            "FIBER_STALL: fiber {fiber_id} is waiting on {}({}) with no asynchronous work outstanding",
            n.kind(),
            n.async_id()
        ),
        (None, code) => format!("{code}: fiber {fiber_id}"),
    };
    if let Some(reason) = reason {
        msg.push_str(&format!(" (reason: {reason})"));
    }
    for hop in trace {
        let edge = match hop.edge {
            TraceEdge::Execution => "created in",
            TraceEdge::Trigger => "triggered by",
        };
        msg.push_str(&format!(
            "\n    {edge} {}({}) fiber={}",
            hop.kind, hop.async_id, hop.fiber_id
        ));
        if let Some(frame) = hop.frame {
            msg.push_str(&format!(" at {}:{}", frame.file(), frame.line()));
        }
    }
    msg
}

fn hop(edge: TraceEdge, node: &Arc<AsyncNode>) -> TraceHop {
    TraceHop {
        edge,
        async_id: node.async_id(),
        kind: node.kind(),
        fiber_id: node.fiber_id(),
        frame: node.frame(),
    }
}

fn build_trace(node: &Arc<AsyncNode>) -> Vec<TraceHop> {
    let mut trace = Vec::new();
    let mut cur = node.execution_origin();
    while let Some(n) = cur {
        trace.push(hop(TraceEdge::Execution, &n));
        if trace.len() >= MAX_TRACE_DEPTH {
            break;
        }
        cur = n.execution_origin();
    }
    if let Some(t) = node.trigger_origin() {
        trace.push(hop(TraceEdge::Trigger, &t));
    }
    trace
}
