//! The affine dispatcher.
//!
//! A [`Dispatcher`] serializes all submitted work onto one designated
//! thread, the affinity thread. Any thread may submit; exactly one thread
//! executes. The queue is priority-ordered and insertion-stable, so two
//! posts from the same thread at the same priority run in submission
//! order.
//!
//! # The drain loop
//!
//! One parameterized loop does all the work: pop the highest-priority
//! oldest pending item, run its callback on the affinity thread, park on
//! the wake signal when the queue is empty, exit when the loop's
//! cancellation token fires. [`run`](Dispatcher::run) is that loop bound
//! to the shutdown token. [`push_frame`](Dispatcher::push_frame) re-enters
//! the same loop recursively, which is how the affinity thread waits for
//! an asynchronous result without blocking: a nested frame keeps servicing
//! newly posted work, including the continuations that complete the very
//! result being awaited.
//!
//! # Failure policy
//!
//! A panic in a [`post`](Dispatcher::post) callback is not caught; it
//! unwinds the affinity thread's loop so fire-and-forget bugs surface
//! loudly. A panic in an [`invoke_async`](Dispatcher::invoke_async) or
//! [`invoke`](Dispatcher::invoke) callback is captured into the work's
//! [`Ticket`] and re-raised only where the result is observed. Tests
//! assert this asymmetry.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::cancel::{CancelSource, CancelToken};
use crate::completion::{CompletionSlot, Ticket};
use crate::context::AmbientContext;
use crate::error::DispatchError;
use crate::metrics::DispatcherMetrics;
use crate::priority::DispatchPriority;
use crate::queue::{WorkItem, WorkQueue};
use crate::timer::DispatcherTimer;

/// Options for an awaitable submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Queue position. Defaults to [`DispatchPriority::Normal`].
    pub priority: DispatchPriority,
    /// Snapshot the submitting thread's [`AmbientContext`] and restore it
    /// around the callback. Opt-in; capturing is not free.
    pub capture_context: bool,
    /// Cancels the work if fired before the callback runs. Checked at
    /// submission and again at dequeue, never mid-callback.
    pub cancel: Option<CancelToken>,
}

pub(crate) struct DispatcherShared {
    affinity: ThreadId,
    queue: Mutex<WorkQueue>,
    wake: Condvar,
    shut_down: AtomicBool,
    shutdown_source: CancelSource,
    shutdown_token: CancelToken,
    pub(crate) timers: Mutex<Vec<DispatcherTimer>>,
    metrics: DispatcherMetrics,
}

impl DispatcherShared {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// A single-owner-thread task scheduler.
///
/// Cloning is cheap and shares the underlying instance; clones may be
/// moved to any thread to submit work.
///
/// # Example
///
/// ```
/// use monorail::Dispatcher;
///
/// let (dispatcher, worker) = Dispatcher::spawn();
/// let ticket = dispatcher.invoke_async(|| 2 + 2).unwrap();
/// assert_eq!(ticket.wait(), Ok(4));
/// dispatcher.shutdown();
/// worker.join().unwrap();
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

impl Dispatcher {
    /// Creates a dispatcher bound to the calling thread.
    ///
    /// The calling thread becomes the affinity thread; it must eventually
    /// drive the queue through [`run`](Self::run) or
    /// [`push_frame`](Self::push_frame) for submitted work to execute.
    #[must_use]
    pub fn new() -> Self {
        let shutdown_source = CancelSource::new();
        let shutdown_token = shutdown_source.token();
        Self {
            shared: Arc::new(DispatcherShared {
                affinity: thread::current().id(),
                queue: Mutex::new(WorkQueue::new()),
                wake: Condvar::new(),
                shut_down: AtomicBool::new(false),
                shutdown_source,
                shutdown_token,
                timers: Mutex::new(Vec::new()),
                metrics: DispatcherMetrics::default(),
            }),
        }
    }

    /// Creates a dispatcher on a fresh dedicated thread and starts its
    /// loop.
    ///
    /// Returns a handle for submitting work plus the join handle of the
    /// affinity thread. The thread exits after [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn spawn() -> (Self, thread::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel();
        let worker = thread::spawn(move || {
            let dispatcher = Dispatcher::new();
            // Hand the clone back before entering the loop; early posts
            // simply wait in the queue until the loop drains them.
            if sender.send(dispatcher.clone()).is_err() {
                return;
            }
            let _ = dispatcher.run();
        });
        let dispatcher = receiver
            .recv()
            .expect("dispatcher thread exited before handing back a handle");
        (dispatcher, worker)
    }

    pub(crate) fn from_shared(shared: Arc<DispatcherShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<DispatcherShared> {
        &self.shared
    }

    /// Returns true iff called from the affinity thread. Never fails.
    #[must_use]
    pub fn check_access(&self) -> bool {
        thread::current().id() == self.shared.affinity
    }

    /// Errors with [`DispatchError::NotOnAffinityThread`] when called from
    /// a foreign thread.
    pub fn verify_access(&self) -> Result<(), DispatchError> {
        if self.check_access() {
            Ok(())
        } else {
            Err(DispatchError::NotOnAffinityThread)
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Statistics counters for this dispatcher.
    #[must_use]
    pub fn metrics(&self) -> &DispatcherMetrics {
        &self.shared.metrics
    }

    fn enqueue(&self, priority: DispatchPriority, item: WorkItem) -> Result<(), DispatchError> {
        if self.is_shut_down() {
            return Err(DispatchError::ShutDown);
        }
        {
            let mut queue = self.shared.queue.lock();
            // Re-checked under the lock: shutdown drains the queue while
            // holding it, so no item can slip in behind the drain.
            if self.is_shut_down() {
                return Err(DispatchError::ShutDown);
            }
            queue.push(priority, item);
            trace!(priority = ?priority, pending = queue.len(), "work enqueued");
        }
        self.shared.metrics.enqueued.increment();
        self.shared.metrics.wakes.increment();
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Enqueues fire-and-forget work at [`DispatchPriority::Normal`].
    ///
    /// Returns immediately; nothing reports the callback's result. A panic
    /// in the callback unwinds the affinity thread's loop.
    pub fn post<F>(&self, callback: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_with(DispatchPriority::default(), callback)
    }

    /// Enqueues fire-and-forget work at `priority`.
    pub fn post_with<F>(&self, priority: DispatchPriority, callback: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(priority, WorkItem::new(Box::new(callback)))
    }

    /// Enqueues awaitable work at [`DispatchPriority::Normal`].
    pub fn invoke_async<T, F>(&self, callback: F) -> Result<Ticket<T>, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.invoke_async_with(SubmitOptions::default(), callback)
    }

    /// Enqueues awaitable work.
    ///
    /// A token already fired at submission yields an already-canceled
    /// ticket without touching the queue. A panic in the callback is
    /// captured into the ticket, not propagated on the affinity thread.
    pub fn invoke_async_with<T, F>(
        &self,
        options: SubmitOptions,
        callback: F,
    ) -> Result<Ticket<T>, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if let Some(token) = &options.cancel {
            if token.is_canceled() {
                let (slot, ticket) = CompletionSlot::new();
                let _ = slot.try_cancel();
                return Ok(ticket);
            }
        }
        let (slot, ticket) = CompletionSlot::new();
        let ack_slot = slot.clone();
        let context = options.capture_context.then(AmbientContext::capture);
        let run = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(callback)) {
                Ok(value) => {
                    let _ = slot.try_succeed(value);
                }
                Err(payload) => {
                    let _ = slot.try_fault(payload);
                }
            }
        });
        let item = WorkItem {
            run,
            context,
            cancel: options.cancel,
            canceled_ack: Some(Box::new(move || {
                let _ = ack_slot.try_cancel();
            })),
        };
        self.enqueue(options.priority, item)?;
        Ok(ticket)
    }

    /// Runs `callback` at [`DispatchPriority::Send`] and blocks until it
    /// finishes.
    ///
    /// On the affinity thread the callback runs inline, with no queueing
    /// and no wake signal. From a foreign thread the callback is posted
    /// and the caller blocks; a panic in the callback resumes on the
    /// caller.
    pub fn invoke<T, F>(&self, callback: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.invoke_with(DispatchPriority::Send, callback)
    }

    /// Runs `callback` at `priority` and blocks until it finishes.
    pub fn invoke_with<T, F>(
        &self,
        priority: DispatchPriority,
        callback: F,
    ) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shut_down() {
            return Err(DispatchError::ShutDown);
        }
        if self.check_access() {
            return Ok(callback());
        }
        let options = SubmitOptions {
            priority,
            ..SubmitOptions::default()
        };
        self.invoke_async_with(options, callback)?.wait()
    }

    /// Returns a ticket that completes once everything at or above
    /// `priority` submitted before this call has executed.
    ///
    /// Implemented as a no-op sentinel at `priority`: the queue is
    /// insertion-stable, so the sentinel cannot run before anything at or
    /// above its level that was already pending.
    pub fn process(&self, priority: DispatchPriority) -> Result<Ticket<()>, DispatchError> {
        let options = SubmitOptions {
            priority,
            ..SubmitOptions::default()
        };
        self.invoke_async_with(options, || {})
    }

    /// Re-enters the drain loop on the affinity thread until `exit` fires.
    ///
    /// Returns immediately, without draining, if `exit` already fired.
    /// Frames nest with stack discipline; each nested frame keeps the
    /// queue moving while an outer frame waits on a result.
    pub fn push_frame(&self, exit: CancelToken) -> Result<(), DispatchError> {
        self.verify_access()?;
        if self.is_shut_down() {
            return Err(DispatchError::ShutDown);
        }
        if exit.is_canceled() {
            return Ok(());
        }
        self.shared.metrics.frames.increment();
        let shared = Arc::clone(&self.shared);
        exit.on_cancel(move || {
            // Taking the queue lock pairs with the wait loop: the drain is
            // either about to re-check the token or parked and notified.
            let _queue = shared.queue.lock();
            shared.wake.notify_one();
        });
        debug!(frames_entered = self.shared.metrics.frames(), "frame entered");
        self.drain_until(&exit);
        debug!("frame exited");
        Ok(())
    }

    /// Waits for `ticket` on the affinity thread without blocking it.
    ///
    /// Fast path: an already-completed ticket returns at once, no frame.
    /// Otherwise a frame gated on the ticket's completion is pushed, so
    /// the queue keeps draining even when the ticket's completion is
    /// driven by continuations posted to this same dispatcher. A captured
    /// panic is resumed here; cancellation is reported as
    /// [`DispatchError::Canceled`], not as a panic.
    pub fn await_completion<T>(&self, ticket: Ticket<T>) -> Result<T, DispatchError>
    where
        T: Send + 'static,
    {
        if ticket.is_complete() {
            return ticket.wait();
        }
        self.verify_access()?;
        let frame_exit = CancelSource::new();
        let exit_token = frame_exit.token();
        ticket.on_complete(move || frame_exit.cancel());
        self.push_frame(exit_token)?;
        if !ticket.is_complete() {
            // The frame was unwound by shutdown, not by completion.
            return Err(DispatchError::ShutDown);
        }
        ticket.wait()
    }

    /// Runs the dispatcher's main loop on the affinity thread.
    ///
    /// Returns after [`shutdown`](Self::shutdown).
    pub fn run(&self) -> Result<(), DispatchError> {
        self.push_frame(self.shared.shutdown_token.clone())
    }

    /// Creates a timer that posts ticks to this dispatcher at `priority`.
    #[must_use]
    pub fn create_timer(&self, priority: DispatchPriority) -> DispatcherTimer {
        DispatcherTimer::new(self, priority)
    }

    /// Shuts the dispatcher down.
    ///
    /// Stops every registered timer, newest to oldest; rejects all further
    /// submissions with [`DispatchError::ShutDown`]; cancels still-queued
    /// awaitable work; and releases the loop so [`run`](Self::run)
    /// returns. Idempotent. Callable from any thread.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let timers: Vec<DispatcherTimer> = {
            let mut registry = self.shared.timers.lock();
            registry.drain(..).collect()
        };
        for timer in timers.iter().rev() {
            timer.force_stop();
        }
        let abandoned = {
            let mut queue = self.shared.queue.lock();
            queue.take_all()
        };
        debug!(
            stopped_timers = timers.len(),
            abandoned = abandoned.len(),
            "dispatcher shut down"
        );
        for item in abandoned {
            if let Some(ack) = item.canceled_ack {
                ack();
            }
        }
        self.shared.shutdown_source.cancel();
        let _queue = self.shared.queue.lock();
        self.shared.wake.notify_one();
    }

    /// The shared drain loop behind [`run`](Self::run) and
    /// [`push_frame`](Self::push_frame).
    fn drain_until(&self, exit: &CancelToken) {
        loop {
            let next = {
                let mut queue = self.shared.queue.lock();
                loop {
                    if exit.is_canceled() || self.is_shut_down() {
                        return;
                    }
                    if let Some(entry) = queue.pop() {
                        break entry;
                    }
                    self.shared.wake.wait(&mut queue);
                }
            };
            // The lock is released across execution; callbacks may submit
            // or push nested frames freely.
            self.run_item(next);
        }
    }

    fn run_item(&self, (priority, item): (DispatchPriority, WorkItem)) {
        if let Some(token) = &item.cancel {
            if token.is_canceled() {
                trace!(priority = ?priority, "work skipped, token fired before dequeue");
                if let Some(ack) = item.canceled_ack {
                    ack();
                }
                return;
            }
        }
        let _ambient = item.context.map(AmbientContext::install);
        self.shared.metrics.executed.increment();
        trace!(priority = ?priority, "work executing");
        (item.run)();
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("affinity", &self.shared.affinity)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
