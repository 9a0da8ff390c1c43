//! Counters for isolation behavior.
//!
//! Always-on atomic counters with a snapshot accessor. With the `metrics`
//! feature enabled, each recording also increments the matching counter on
//! the `metrics` facade.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters of graph and watchdog activity.
#[derive(Debug)]
pub struct IsolationMetrics {
    nodes_created: AtomicU64,
    events_dispatched: AtomicU64,
    faults_raised: AtomicU64,
    nodes_tainted: AtomicU64,
    fibers_launched: AtomicU64,
    stall_probes: AtomicU64,
}

/// Point-in-time copy of [`IsolationMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Shadow nodes created.
    pub nodes_created: u64,
    /// Lifecycle events forwarded to armed hooks.
    pub events_dispatched: u64,
    /// Faults tripped by watchdogs.
    pub faults_raised: u64,
    /// Nodes reached by abort taints.
    pub nodes_tainted: u64,
    /// Fibers activated.
    pub fibers_launched: u64,
    /// Stall probes that ran.
    pub stall_probes: u64,
}

static GLOBAL: IsolationMetrics = IsolationMetrics::new();

/// The process-wide metrics instance.
#[must_use]
pub fn global() -> &'static IsolationMetrics {
    &GLOBAL
}

impl IsolationMetrics {
    const fn new() -> Self {
        Self {
            nodes_created: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            faults_raised: AtomicU64::new(0),
            nodes_tainted: AtomicU64::new(0),
            fibers_launched: AtomicU64::new(0),
            stall_probes: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn node_created(&self) {
        self.nodes_created.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        metrics::counter!("fiber_pulse.nodes_created").increment(1);
    }

    #[inline]
    pub(crate) fn event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        metrics::counter!("fiber_pulse.events_dispatched").increment(1);
    }

    #[inline]
    pub(crate) fn fault_raised(&self) {
        self.faults_raised.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        metrics::counter!("fiber_pulse.faults_raised").increment(1);
    }

    #[inline]
    pub(crate) fn node_tainted(&self) {
        self.nodes_tainted.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        metrics::counter!("fiber_pulse.nodes_tainted").increment(1);
    }

    #[inline]
    pub(crate) fn fiber_launched(&self) {
        self.fibers_launched.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        metrics::counter!("fiber_pulse.fibers_launched").increment(1);
    }

    #[inline]
    pub(crate) fn stall_probe(&self) {
        self.stall_probes.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        metrics::counter!("fiber_pulse.stall_probes").increment(1);
    }

    /// Copies the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            nodes_created: self.nodes_created.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            faults_raised: self.faults_raised.load(Ordering::Relaxed),
            nodes_tainted: self.nodes_tainted.load(Ordering::Relaxed),
            fibers_launched: self.fibers_launched.load(Ordering::Relaxed),
            stall_probes: self.stall_probes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recordings() {
        let before = global().snapshot();
        global().node_created();
        global().fault_raised();
        let after = global().snapshot();
        assert!(after.nodes_created >= before.nodes_created + 1);
        assert!(after.faults_raised >= before.faults_raised + 1);
    }
}
