//! One-shot wake notification for worker event loops.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Edge-triggered one-shot wake signal.
///
/// `signal` wakes the next `wait`; signals arriving between two `consume`
/// calls coalesce into one pending wake. `consume` never blocks. Clones
/// share the same underlying signal.
#[derive(Clone)]
pub struct WakeNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    pending: Mutex<bool>,
    condvar: Condvar,
    signals: AtomicU64,
}

impl WakeNotifier {
    /// Creates a notifier with no pending wake.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                pending: Mutex::new(false),
                condvar: Condvar::new(),
                signals: AtomicU64::new(0),
            }),
        }
    }

    /// Arms the notifier and wakes a blocked `wait`, if any.
    pub fn signal(&self) {
        self.inner.signals.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.inner.pending.lock();
        if !*pending {
            *pending = true;
            self.inner.condvar.notify_one();
        }
    }

    /// Blocks until a signal is pending. Does not clear it.
    pub fn wait(&self) {
        let mut pending = self.inner.pending.lock();
        while !*pending {
            self.inner.condvar.wait(&mut pending);
        }
    }

    /// Blocks until a signal is pending or the timeout elapses.
    ///
    /// Returns true if a signal is pending.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.inner.pending.lock();
        if !*pending {
            let _ = self.inner.condvar.wait_for(&mut pending, timeout);
        }
        *pending
    }

    /// Clears pending signals. Never blocks.
    pub fn consume(&self) {
        *self.inner.pending.lock() = false;
    }

    /// Returns true if a signal is pending.
    pub fn is_pending(&self) -> bool {
        *self.inner.pending.lock()
    }

    /// Total `signal` calls since creation.
    pub fn signals_sent(&self) -> u64 {
        self.inner.signals.load(Ordering::Relaxed)
    }
}

impl Default for WakeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
