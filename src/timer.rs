//! Recurring timers bound to a dispatcher.
//!
//! A [`DispatcherTimer`] never runs user code on its trigger thread. Each
//! trigger firing posts a tick work item onto the owning dispatcher at the
//! timer's priority, so the tick handler always executes on the affinity
//! thread and queues behind higher-priority work like anything else.
//!
//! State machine: `Stopped --start--> Running --stop--> Stopped`. While
//! running, the timer sits in the owner's live-timer registry so
//! [`Dispatcher::shutdown`](crate::Dispatcher::shutdown) can force-stop
//! it. Changing the interval of a running timer tears the trigger down
//! and spawns a fresh one without leaving the `Running` state.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::dispatcher::{Dispatcher, DispatcherShared};
use crate::error::{DispatchError, MAX_TIMER_INTERVAL};
use crate::priority::DispatchPriority;

/// The interval a freshly created timer starts with.
pub const DEFAULT_TIMER_INTERVAL: Duration = Duration::from_secs(1);

type TickHandler = Box<dyn FnMut() + Send>;

fn validate_interval(interval: Duration) -> Result<(), DispatchError> {
    if interval.is_zero() || interval > MAX_TIMER_INTERVAL {
        return Err(DispatchError::InvalidInterval {
            given: interval,
            max: MAX_TIMER_INTERVAL,
        });
    }
    Ok(())
}

struct TriggerStop {
    stopped: Mutex<bool>,
    signal: Condvar,
}

/// A dedicated thread parked in a timed condvar wait, firing a callback
/// once per interval until disposed. Runs no user code itself.
struct PeriodicTrigger {
    stop: Arc<TriggerStop>,
}

impl PeriodicTrigger {
    fn spawn<F>(interval: Duration, fire: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let stop = Arc::new(TriggerStop {
            stopped: Mutex::new(false),
            signal: Condvar::new(),
        });
        let shared = Arc::clone(&stop);
        thread::spawn(move || loop {
            {
                let mut stopped = shared.stopped.lock();
                if *stopped {
                    return;
                }
                let timed_out = shared.signal.wait_for(&mut stopped, interval).timed_out();
                if *stopped {
                    return;
                }
                if !timed_out {
                    continue;
                }
            }
            fire();
        });
        Self { stop }
    }

    /// Consumes the trigger; the backing thread exits promptly. Taking
    /// the trigger out of its owning `Option` is what rules out a double
    /// disposal.
    fn dispose(self) {
        let mut stopped = self.stop.stopped.lock();
        *stopped = true;
        self.stop.signal.notify_one();
    }
}

struct TimerState {
    enabled: bool,
    interval: Duration,
    trigger: Option<PeriodicTrigger>,
}

struct TimerInner {
    owner: Weak<DispatcherShared>,
    priority: DispatchPriority,
    state: Mutex<TimerState>,
    handler: Mutex<Option<TickHandler>>,
}

/// A recurring timer whose ticks run on the owning dispatcher's affinity
/// thread.
///
/// Clones share the timer. Created through
/// [`Dispatcher::create_timer`](crate::Dispatcher::create_timer).
#[derive(Clone)]
pub struct DispatcherTimer {
    inner: Arc<TimerInner>,
}

impl DispatcherTimer {
    pub(crate) fn new(owner: &Dispatcher, priority: DispatchPriority) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                owner: Arc::downgrade(owner.shared()),
                priority,
                state: Mutex::new(TimerState {
                    enabled: false,
                    interval: DEFAULT_TIMER_INTERVAL,
                    trigger: None,
                }),
                handler: Mutex::new(None),
            }),
        }
    }

    /// The priority ticks are posted at.
    #[must_use]
    pub fn priority(&self) -> DispatchPriority {
        self.inner.priority
    }

    /// The current interval between ticks.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.state.lock().interval
    }

    /// Returns true while the timer is running.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    /// Replaces the tick handler. The handler runs on the affinity thread.
    pub fn on_tick<F>(&self, handler: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.inner.handler.lock() = Some(Box::new(handler));
    }

    /// Changes the interval.
    ///
    /// Zero and intervals above [`MAX_TIMER_INTERVAL`] are rejected, never
    /// clamped. On a running timer the trigger is torn down and recreated
    /// with the new interval; the timer stays enabled throughout.
    pub fn set_interval(&self, interval: Duration) -> Result<(), DispatchError> {
        validate_interval(interval)?;
        let mut state = self.inner.state.lock();
        state.interval = interval;
        if state.enabled {
            if let Some(trigger) = state.trigger.take() {
                trigger.dispose();
            }
            state.trigger = Some(self.spawn_trigger(interval));
            trace!(interval = ?interval, "running timer rearmed");
        }
        Ok(())
    }

    /// Starts the timer. A no-op on a running timer.
    ///
    /// Fails with [`DispatchError::ShutDown`] when the owning dispatcher
    /// has shut down or no longer exists.
    pub fn start(&self) -> Result<(), DispatchError> {
        let owner = self.inner.owner.upgrade().ok_or(DispatchError::ShutDown)?;
        let mut state = self.inner.state.lock();
        if state.enabled {
            return Ok(());
        }
        {
            // Registration shares the registry lock with shutdown, which
            // flips the flag before draining the registry: either this
            // start loses and fails, or the timer lands in the registry
            // and shutdown stops it.
            let mut registry = owner.timers.lock();
            if owner.is_shut_down() {
                return Err(DispatchError::ShutDown);
            }
            registry.push(self.clone());
        }
        state.enabled = true;
        state.trigger = Some(self.spawn_trigger(state.interval));
        debug!(priority = ?self.inner.priority, interval = ?state.interval, "timer started");
        Ok(())
    }

    /// Stops the timer and disposes its trigger. A no-op on a stopped
    /// timer.
    pub fn stop(&self) {
        self.halt();
        if let Some(owner) = self.inner.owner.upgrade() {
            let mut registry = owner.timers.lock();
            registry.retain(|timer| !Arc::ptr_eq(&timer.inner, &self.inner));
        }
    }

    /// Maps `true` to [`start`](Self::start) and `false` to
    /// [`stop`](Self::stop).
    pub fn set_enabled(&self, enabled: bool) -> Result<(), DispatchError> {
        if enabled {
            self.start()
        } else {
            self.stop();
            Ok(())
        }
    }

    /// Stop without touching the registry. Shutdown already holds the
    /// drained registry entries.
    pub(crate) fn force_stop(&self) {
        self.halt();
    }

    fn halt(&self) {
        let mut state = self.inner.state.lock();
        if !state.enabled {
            return;
        }
        state.enabled = false;
        if let Some(trigger) = state.trigger.take() {
            trigger.dispose();
        }
        debug!(priority = ?self.inner.priority, "timer stopped");
    }

    fn spawn_trigger(&self, interval: Duration) -> PeriodicTrigger {
        let weak = Arc::downgrade(&self.inner);
        PeriodicTrigger::spawn(interval, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let Some(owner) = inner.owner.upgrade() else {
                return;
            };
            let dispatcher = Dispatcher::from_shared(owner);
            let timer = DispatcherTimer { inner };
            let priority = timer.priority();
            if let Err(error) = dispatcher.post_with(priority, move || timer.run_tick()) {
                debug!(%error, "timer tick dropped");
            }
        })
    }

    /// Runs one tick on the affinity thread. Skipped when the timer was
    /// stopped between the trigger firing and this item being dequeued.
    fn run_tick(&self) {
        if !self.is_enabled() {
            trace!("tick skipped, timer stopped while queued");
            return;
        }
        // The handler is taken out for the call so it can re-enter the
        // timer (stop, rearm, replace the handler) without deadlocking.
        let handler = self.inner.handler.lock().take();
        if let Some(mut handler) = handler {
            handler();
            let mut slot = self.inner.handler.lock();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }
}

impl std::fmt::Debug for DispatcherTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DispatcherTimer")
            .field("priority", &self.inner.priority)
            .field("enabled", &state.enabled)
            .field("interval", &state.interval)
            .finish()
    }
}
