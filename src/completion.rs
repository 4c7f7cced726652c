//! Single-assignment completion cells.
//!
//! Every awaitable submission produces a pair: the dispatcher keeps the
//! write half ([`CompletionSlot`]) inside the queued work item, the caller
//! gets the read half ([`Ticket`]). The cell admits exactly one terminal
//! transition out of `Pending`:
//!
//! - `Succeeded(value)` when the callback returned,
//! - `Faulted(payload)` when the callback panicked,
//! - `Canceled` when the work's token fired before the callback ran.
//!
//! All `try_*` setters are idempotent: the first one wins, later attempts
//! return false and change nothing. Continuations attached through
//! [`Ticket::on_complete`] run on the completing thread; a continuation
//! attached after completion runs inline on the attaching thread.

use std::any::Any;
use std::panic::resume_unwind;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::error::DispatchError;

type Continuation = Box<dyn FnOnce() + Send>;

enum Outcome<T> {
    Succeeded(T),
    Faulted(Box<dyn Any + Send>),
    Canceled,
}

struct SlotState<T> {
    outcome: Option<Outcome<T>>,
    /// Set once the waiting side took the outcome out; blocks any further
    /// terminal transition attempt from "winning" against a taken slot.
    consumed: bool,
    continuations: SmallVec<[Continuation; 2]>,
}

struct SlotShared<T> {
    state: Mutex<SlotState<T>>,
    done: Condvar,
}

/// Write half of a completion cell.
pub(crate) struct CompletionSlot<T> {
    shared: Arc<SlotShared<T>>,
}

impl<T> Clone for CompletionSlot<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> CompletionSlot<T> {
    /// Creates a pending cell and returns both halves.
    pub(crate) fn new() -> (Self, Ticket<T>) {
        let shared = Arc::new(SlotShared {
            state: Mutex::new(SlotState {
                outcome: None,
                consumed: false,
                continuations: SmallVec::new(),
            }),
            done: Condvar::new(),
        });
        let ticket = Ticket {
            shared: Arc::clone(&shared),
        };
        (Self { shared }, ticket)
    }

    fn complete(&self, outcome: Outcome<T>) -> bool {
        let continuations = {
            let mut state = self.shared.state.lock();
            if state.consumed || state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            self.shared.done.notify_all();
            std::mem::take(&mut state.continuations)
        };
        // Continuations run outside the lock; they may attach more work.
        for continuation in continuations {
            continuation();
        }
        true
    }

    pub(crate) fn try_succeed(&self, value: T) -> bool {
        self.complete(Outcome::Succeeded(value))
    }

    pub(crate) fn try_fault(&self, payload: Box<dyn Any + Send>) -> bool {
        self.complete(Outcome::Faulted(payload))
    }

    pub(crate) fn try_cancel(&self) -> bool {
        self.complete(Outcome::Canceled)
    }
}

/// Read half of a completion cell: the eventual result of an awaitable
/// submission.
///
/// `Ticket` is the value returned by
/// [`Dispatcher::invoke_async`](crate::Dispatcher::invoke_async) and
/// friends. A foreign thread may block on [`wait`](Self::wait); the
/// affinity thread must instead go through
/// [`Dispatcher::await_completion`](crate::Dispatcher::await_completion),
/// which keeps draining the queue while it waits.
pub struct Ticket<T> {
    shared: Arc<SlotShared<T>>,
}

impl<T> Ticket<T> {
    /// Returns true once the cell left `Pending`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// Registers `continuation` to run when the cell completes.
    ///
    /// Runs inline if the cell already completed.
    pub fn on_complete<F>(&self, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.outcome.is_some() || state.consumed {
            drop(state);
            continuation();
        } else {
            state.continuations.push(Box::new(continuation));
        }
    }

    /// Blocks the calling thread until the cell completes, then returns
    /// the value, resumes the captured panic, or reports cancellation.
    ///
    /// Must not be called on the dispatcher's affinity thread while the
    /// producing work is still queued there; that is what
    /// [`Dispatcher::await_completion`](crate::Dispatcher::await_completion)
    /// is for.
    pub fn wait(self) -> Result<T, DispatchError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = state.outcome.take() {
                state.consumed = true;
                drop(state);
                return match outcome {
                    Outcome::Succeeded(value) => Ok(value),
                    Outcome::Faulted(payload) => resume_unwind(payload),
                    Outcome::Canceled => Err(DispatchError::Canceled),
                };
            }
            self.shared.done.wait(&mut state);
        }
    }
}

impl<T> std::fmt::Debug for Ticket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("complete", &self.is_complete())
            .finish()
    }
}
