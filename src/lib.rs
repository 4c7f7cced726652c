//! Single-owner-thread task dispatching.
//!
//! Interactive applications need every mutation of shared state to happen
//! on one thread, while any thread may ask for work to be done there.
//! This crate provides that serialization layer:
//!
//! - [`Dispatcher`]: an affine, priority-ordered scheduler. One designated
//!   thread executes everything; other threads post, invoke, and wait.
//! - [`DispatcherTimer`]: recurring ticks posted through the same priority
//!   path, so they run on the affinity thread like any other work.
//! - Frames: [`Dispatcher::push_frame`] re-enters the drain loop so the
//!   affinity thread can synchronously await an asynchronous result
//!   ([`Dispatcher::await_completion`]) without blocking its own queue.
//! - [`MessagePump`]: a FIFO-only variant of the same contract for
//!   dedicated worker threads.
//!
//! Concurrency comes from multiple independent instances, never from
//! parallel execution inside one instance.
//!
//! # Ordering guarantees
//!
//! Within one priority level work runs in submission order; across levels
//! strictly priority-descending. [`Dispatcher::process`] gives a barrier:
//! its ticket completes only after everything at or above the given level
//! submitted before the call has run.
//!
//! # Example
//!
//! ```
//! use monorail::{DispatchPriority, Dispatcher};
//!
//! let (dispatcher, worker) = Dispatcher::spawn();
//!
//! dispatcher.post(|| println!("runs on the affinity thread")).unwrap();
//! let answer = dispatcher
//!     .invoke_async(|| 6 * 7)
//!     .unwrap()
//!     .wait()
//!     .unwrap();
//! assert_eq!(answer, 42);
//!
//! // Wait until all normal-or-higher work submitted so far has drained.
//! dispatcher.process(DispatchPriority::Normal).unwrap().wait().unwrap();
//!
//! dispatcher.shutdown();
//! worker.join().unwrap();
//! ```

#![warn(missing_docs)]

mod cancel;
mod completion;
mod context;
mod dispatcher;
mod error;
mod metrics;
mod priority;
mod pump;
mod queue;
mod timer;

pub use cancel::{CancelSource, CancelToken};
pub use completion::Ticket;
pub use context::{AmbientContext, AmbientGuard};
pub use dispatcher::{Dispatcher, SubmitOptions};
pub use error::{DispatchError, MAX_TIMER_INTERVAL};
pub use metrics::{Counter, DispatcherMetrics};
pub use priority::DispatchPriority;
pub use pump::MessagePump;
pub use timer::{DispatcherTimer, DEFAULT_TIMER_INTERVAL};
