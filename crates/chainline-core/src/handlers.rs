//! Ordered multi-subscriber callback registry.
//!
//! One pool per event category. The engine produces; arbitrarily many
//! application-level consumers subscribe without the engine knowing their
//! identities.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

/// Append-only, unbounded ordered set of callbacks for one event
/// category. No de-duplication and no removal: a handler registered
/// twice runs twice.
pub struct HandlerPool<T> {
    name: &'static str,
    handlers: Mutex<Vec<Handler<T>>>,
}

impl<T> HandlerPool<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, handler: impl Fn(&T) + Send + Sync + 'static) {
        self.lock().push(Arc::new(handler));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Invoke every registered handler with `payload`, in registration
    /// order. A panicking handler is isolated and logged; subsequent
    /// handlers still run.
    pub fn run(&self, payload: &T) {
        let snapshot: Vec<Handler<T>> = self.lock().clone();
        for (index, handler) in snapshot.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                warn!(pool = self.name, index, "subscriber panicked, continuing");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Handler<T>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
