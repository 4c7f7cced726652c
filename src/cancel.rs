//! Cancellation protocol.
//!
//! A [`CancelSource`] owns the right to cancel; [`CancelToken`]s are cheap
//! clonable observers handed to submitted work, timers, and frames.
//! Cancellation is a one-way latch: once fired it never resets.
//!
//! Tokens support callback registration through [`CancelToken::on_cancel`].
//! Every registered callback runs exactly once, on the canceling thread;
//! a callback registered after the token already fired runs inline on the
//! registering thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

type CancelCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancelState {
    canceled: AtomicBool,
    callbacks: Mutex<SmallVec<[CancelCallback; 2]>>,
}

/// The owning half of a cancellation pair.
pub struct CancelSource {
    state: Arc<CancelState>,
}

impl CancelSource {
    /// Creates a new, un-fired source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState::default()),
        }
    }

    /// Returns a token observing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Arc::clone(&self.state),
        }
    }

    /// Fires the cancellation. Idempotent; callbacks run once, here.
    pub fn cancel(&self) {
        if self.state.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.state.callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Acquire)
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Observer half of a cancellation pair.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// Returns a token that is already fired.
    #[must_use]
    pub fn canceled() -> Self {
        let state = CancelState::default();
        state.canceled.store(true, Ordering::Release);
        Self {
            state: Arc::new(state),
        }
    }

    /// Returns true once the owning source fired.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Acquire)
    }

    /// Registers `callback` to run when the token fires.
    ///
    /// If the token already fired, `callback` runs inline before this
    /// returns. Either way it runs exactly once.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = self.state.callbacks.lock();
        // The flag is re-read under the callback lock: cancel() flips it
        // before draining, so a callback pushed here is always drained.
        if self.state.canceled.load(Ordering::Acquire) {
            drop(callbacks);
            callback();
        } else {
            callbacks.push(Box::new(callback));
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
