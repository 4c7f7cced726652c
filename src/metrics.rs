//! Dispatcher statistics counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increments the counter by 1.
    #[inline]
    pub(crate) fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters exposed by a [`Dispatcher`](crate::Dispatcher).
///
/// All counters use relaxed atomics; they are statistics, not
/// synchronization. `wakes` counts wake-signal notifications, so an inline
/// execution path (same-thread `invoke`) leaves it untouched.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    pub(crate) enqueued: Counter,
    pub(crate) executed: Counter,
    pub(crate) wakes: Counter,
    pub(crate) frames: Counter,
}

impl DispatcherMetrics {
    /// Work items accepted into the queue.
    #[must_use]
    pub fn enqueued(&self) -> u64 {
        self.enqueued.get()
    }

    /// Work items whose callback ran.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed.get()
    }

    /// Wake-signal notifications sent to the affinity thread.
    #[must_use]
    pub fn wakes(&self) -> u64 {
        self.wakes.get()
    }

    /// Frames entered, the outermost loop included.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames.get()
    }
}
