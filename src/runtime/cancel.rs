//! Opt-in cancellation signal for fibers.
//!
//! A [`CancelSource`] is held by whoever decides to abort; the paired
//! [`CancelSignal`] is handed to [`fiber_with`](crate::fiber_with) and can be
//! cloned freely. Raising the source is a one-shot transition: the reason is
//! recorded, subscribers run once, and the signal stays raised forever.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Subscriber = Box<dyn FnOnce(&str)>;

struct CancelState {
    raised: AtomicBool,
    reason: RwLock<Option<String>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// The raising half of a cancellation pair.
pub struct CancelSource {
    state: Arc<CancelState>,
}

/// The observing half of a cancellation pair.
#[derive(Clone)]
pub struct CancelSignal {
    state: Arc<CancelState>,
}

impl CancelSource {
    /// Creates a fresh, un-raised cancellation pair.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState {
                raised: AtomicBool::new(false),
                reason: RwLock::new(None),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns a signal observing this source.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            state: Arc::clone(&self.state),
        }
    }

    /// Raises the signal with a reason. Subsequent calls are no-ops; the
    /// first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self.state.raised.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = reason.into();
        *self.state.reason.write() = Some(reason.clone());

        #[cfg(feature = "tracing")]
        tracing::debug!(reason = %reason, "cancellation signal raised");

        let subscribers = std::mem::take(&mut *self.state.subscribers.lock());
        for sub in subscribers {
            sub(&reason);
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// Whether the source has been raised.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.state.raised.load(Ordering::Acquire)
    }

    /// The recorded reason, if raised.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.state.reason.read().clone()
    }

    /// Registers a one-shot callback. Runs immediately when the signal is
    /// already raised.
    pub(crate) fn subscribe(&self, f: impl FnOnce(&str) + 'static) {
        if self.is_raised() {
            let reason = self.reason().unwrap_or_default();
            f(&reason);
            return;
        }
        let mut subs = self.state.subscribers.lock();
        // The raise may have landed between the check and the lock.
        if self.is_raised() {
            drop(subs);
            let reason = self.reason().unwrap_or_default();
            f(&reason);
            return;
        }
        subs.push(Box::new(f));
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("raised", &self.state.raised.load(Ordering::Acquire))
            .finish()
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSignal")
            .field("raised", &self.is_raised())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn signal_starts_lowered() {
        let source = CancelSource::new();
        let signal = source.signal();
        assert!(!signal.is_raised());
        assert_eq!(signal.reason(), None);
    }

    #[test]
    fn first_reason_wins() {
        let source = CancelSource::new();
        let signal = source.signal();
        source.cancel("deadline");
        source.cancel("shutdown");
        assert!(signal.is_raised());
        assert_eq!(signal.reason().as_deref(), Some("deadline"));
    }

    #[test]
    fn subscribers_run_once_with_reason() {
        let source = CancelSource::new();
        let signal = source.signal();
        let seen = Rc::new(Cell::new(false));
        let seen2 = Rc::clone(&seen);
        signal.subscribe(move |reason| {
            assert_eq!(reason, "user abort");
            seen2.set(true);
        });
        assert!(!seen.get());
        source.cancel("user abort");
        assert!(seen.get());
    }

    #[test]
    fn late_subscriber_fires_immediately() {
        let source = CancelSource::new();
        source.cancel("gone");
        let seen = Rc::new(Cell::new(false));
        let seen2 = Rc::clone(&seen);
        source.signal().subscribe(move |_| seen2.set(true));
        assert!(seen.get());
    }
}
