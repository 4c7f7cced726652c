//! Ambient context capture and restoration.
//!
//! Some call-site state is ambient: a request id, a locale, a trace scope.
//! When work hops from the submitting thread to the affinity thread, that
//! state would normally be lost. [`AmbientContext`] makes the hop explicit:
//! a submission made with `capture_context` snapshots the submitting
//! thread's current context, and the dispatcher installs the snapshot
//! around the callback so reads inside it behave as if no hop happened.
//!
//! The context is an immutable value object. Deriving a new context with
//! [`with_value`](AmbientContext::with_value) never mutates an existing
//! snapshot, so captured snapshots stay stable however long they sit in
//! the queue. Capture is opt-in because snapshotting is not free.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type ContextValues = HashMap<&'static str, Arc<dyn Any + Send + Sync>>;

thread_local! {
    static CURRENT: RefCell<AmbientContext> = RefCell::new(AmbientContext::empty());
}

/// An immutable snapshot of named ambient values.
#[derive(Clone, Default)]
pub struct AmbientContext {
    values: Arc<ContextValues>,
}

impl AmbientContext {
    /// Returns a context with no values.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshots the calling thread's current context.
    #[must_use]
    pub fn capture() -> Self {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Returns a new context with `value` bound under `key`.
    ///
    /// The receiver is unchanged.
    #[must_use]
    pub fn with_value<V>(&self, key: &'static str, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        let mut values: ContextValues = (*self.values).clone();
        values.insert(key, Arc::new(value));
        Self {
            values: Arc::new(values),
        }
    }

    /// Looks up the value bound under `key`, if any and of type `V`.
    #[must_use]
    pub fn get<V>(&self, key: &'static str) -> Option<Arc<V>>
    where
        V: Any + Send + Sync,
    {
        self.values
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<V>().ok())
    }

    /// Returns the number of bound values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no values are bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Installs `context` as the calling thread's current context.
    ///
    /// The previous context is restored when the guard drops, so installs
    /// nest like a stack.
    #[must_use]
    pub fn install(context: AmbientContext) -> AmbientGuard {
        let previous = CURRENT.with(|current| current.replace(context));
        AmbientGuard {
            previous: Some(previous),
        }
    }
}

impl fmt::Debug for AmbientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmbientContext")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Restores the previously current context when dropped.
#[must_use]
pub struct AmbientGuard {
    previous: Option<AmbientContext>,
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            CURRENT.with(|current| {
                *current.borrow_mut() = previous;
            });
        }
    }
}
