//! Error types and error-handling strategy.
//!
//! Failures split into two classes with deliberately different surfaces:
//!
//! - **Recoverable** failures of awaited work (a callback panicked, a
//!   submission was canceled) never surface at submission time. They are
//!   captured into the work's [`Ticket`](crate::Ticket) and observed only
//!   when the caller waits on it.
//! - **Non-recoverable** programming errors (submitting to a shut-down
//!   dispatcher, calling an affinity-only operation off-thread) surface
//!   synchronously as `Err` from the submitting call. A panic inside a
//!   fire-and-forget [`post`](crate::Dispatcher::post) callback is not
//!   caught at all and unwinds the affinity thread's loop.

use std::time::Duration;

use thiserror::Error;

/// The longest interval a [`DispatcherTimer`](crate::DispatcherTimer)
/// accepts.
pub const MAX_TIMER_INTERVAL: Duration = Duration::from_millis(i32::MAX as u64);

/// Errors reported by dispatcher, timer, and pump operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// An affinity-only operation was called from a foreign thread.
    #[error("operation requires the dispatcher's affinity thread")]
    NotOnAffinityThread,

    /// A submission arrived after the dispatcher or pump shut down.
    #[error("dispatcher has shut down")]
    ShutDown,

    /// The work's cancellation token fired before the callback ran.
    #[error("work was canceled before it ran")]
    Canceled,

    /// A timer interval was zero or larger than [`MAX_TIMER_INTERVAL`].
    #[error("timer interval must be positive and at most {max:?}, got {given:?}")]
    InvalidInterval {
        /// The rejected interval.
        given: Duration,
        /// The accepted maximum.
        max: Duration,
    },
}
