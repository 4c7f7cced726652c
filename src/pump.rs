//! FIFO message pump.
//!
//! The pump implements the same post/invoke-async contract as the
//! dispatcher but with weaker guarantees: no priorities, plain submission
//! order, and a simpler shutdown handshake. It is meant to own a
//! dedicated worker thread rather than an interactive affinity thread.
//!
//! [`run`](MessagePump::run) drains the queue to empty, parks on the wake
//! signal, and repeats until its exit token fires; it then performs one
//! final drain before clearing state, so nothing submitted before the
//! exit request is dropped.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::completion::{CompletionSlot, Ticket};
use crate::error::DispatchError;

struct PumpEntry {
    run: Box<dyn FnOnce() + Send>,
    cancel: Option<CancelToken>,
    canceled_ack: Option<Box<dyn FnOnce() + Send>>,
}

struct PumpState {
    queue: VecDeque<PumpEntry>,
    shut_down: bool,
}

struct PumpShared {
    state: Mutex<PumpState>,
    wake: Condvar,
}

/// A FIFO-only scheduler for a dedicated worker thread.
///
/// Clones share the pump; any thread may submit.
///
/// # Example
///
/// ```
/// use monorail::{CancelSource, MessagePump};
///
/// let pump = MessagePump::new();
/// let exit = CancelSource::new();
/// let ticket = pump.invoke_async(None, || 6 * 7).unwrap();
/// let worker = pump.run_in_thread(exit.token());
/// assert_eq!(ticket.wait(), Ok(42));
/// exit.cancel();
/// worker.join().unwrap();
/// ```
#[derive(Clone)]
pub struct MessagePump {
    shared: Arc<PumpShared>,
}

impl MessagePump {
    /// Creates an empty pump.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PumpShared {
                state: Mutex::new(PumpState {
                    queue: VecDeque::new(),
                    shut_down: false,
                }),
                wake: Condvar::new(),
            }),
        }
    }

    /// Number of entries waiting in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Returns true when no entries are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().queue.is_empty()
    }

    fn enqueue(&self, entry: PumpEntry) -> Result<(), DispatchError> {
        {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return Err(DispatchError::ShutDown);
            }
            state.queue.push_back(entry);
            trace!(pending = state.queue.len(), "pump entry enqueued");
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Enqueues fire-and-forget work.
    ///
    /// The token is checked when the entry is dequeued, not here, so a
    /// cancellation racing the queue still suppresses the callback.
    pub fn post<F>(&self, cancel: Option<CancelToken>, callback: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(PumpEntry {
            run: Box::new(callback),
            cancel,
            canceled_ack: None,
        })
    }

    /// Enqueues awaitable work.
    ///
    /// An already-fired token short-circuits to a canceled ticket without
    /// enqueuing. A panic in the callback is captured into the ticket; a
    /// token fired while the entry sat in the queue surfaces as
    /// [`DispatchError::Canceled`], not as a fault, so callers can tell
    /// "gave up" from "broke".
    pub fn invoke_async<T, F>(
        &self,
        cancel: Option<CancelToken>,
        callback: F,
    ) -> Result<Ticket<T>, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if let Some(token) = &cancel {
            if token.is_canceled() {
                let (slot, ticket) = CompletionSlot::new();
                let _ = slot.try_cancel();
                return Ok(ticket);
            }
        }
        let (slot, ticket) = CompletionSlot::new();
        let ack_slot = slot.clone();
        self.enqueue(PumpEntry {
            run: Box::new(move || match catch_unwind(AssertUnwindSafe(callback)) {
                Ok(value) => {
                    let _ = slot.try_succeed(value);
                }
                Err(payload) => {
                    let _ = slot.try_fault(payload);
                }
            }),
            cancel,
            canceled_ack: Some(Box::new(move || {
                let _ = ack_slot.try_cancel();
            })),
        })?;
        Ok(ticket)
    }

    /// The pump's main loop.
    ///
    /// Drains all queued callbacks, parks on the wake signal, and repeats
    /// until `exit` fires; then drains once more and marks the pump shut
    /// down. Every entry enqueued before the exit request executes exactly
    /// once.
    pub fn run(&self, exit: CancelToken) {
        let shared = Arc::clone(&self.shared);
        exit.on_cancel(move || {
            let _state = shared.state.lock();
            shared.wake.notify_one();
        });
        debug!("pump running");
        loop {
            self.drain();
            let mut state = self.shared.state.lock();
            if exit.is_canceled() {
                break;
            }
            if state.queue.is_empty() {
                self.shared.wake.wait(&mut state);
            }
        }
        // Final drain: entries that arrived before the exit request (or
        // raced it) still run.
        self.drain();
        let leftovers = {
            let mut state = self.shared.state.lock();
            state.shut_down = true;
            std::mem::take(&mut state.queue)
        };
        for entry in leftovers {
            if let Some(ack) = entry.canceled_ack {
                ack();
            }
        }
        debug!("pump stopped");
    }

    /// Spins up a dedicated thread running [`run`](Self::run).
    pub fn run_in_thread(&self, exit: CancelToken) -> thread::JoinHandle<()> {
        self.run_in_thread_with(|| {}, exit)
    }

    /// Like [`run_in_thread`](Self::run_in_thread), with a setup action
    /// that runs on the pump thread before the loop starts.
    pub fn run_in_thread_with<S>(&self, setup: S, exit: CancelToken) -> thread::JoinHandle<()>
    where
        S: FnOnce() + Send + 'static,
    {
        let pump = self.clone();
        thread::spawn(move || {
            setup();
            pump.run(exit);
        })
    }

    fn drain(&self) {
        loop {
            let entry = {
                let mut state = self.shared.state.lock();
                state.queue.pop_front()
            };
            match entry {
                Some(entry) => Self::run_entry(entry),
                None => return,
            }
        }
    }

    fn run_entry(entry: PumpEntry) {
        if let Some(token) = &entry.cancel {
            if token.is_canceled() {
                trace!("pump entry skipped, token fired before dequeue");
                if let Some(ack) = entry.canceled_ack {
                    ack();
                }
                return;
            }
        }
        (entry.run)();
    }
}

impl Default for MessagePump {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessagePump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MessagePump")
            .field("pending", &state.queue.len())
            .field("shut_down", &state.shut_down)
            .finish()
    }
}
