//! One-shot readiness barrier.
//!
//! Work requested before the transport is live is queued and released
//! exactly once, in FIFO order, when readiness is signaled. Callers never
//! need to know whether the gate is already open.

use std::mem;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum GateState {
    Pending(Vec<Callback>),
    Open,
}

/// A one-shot barrier: `NotReady` until [`ReadyGate::open`] fires, then
/// permanently `Ready`.
pub struct ReadyGate {
    state: Mutex<GateState>,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Pending(Vec::new())),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lock(), GateState::Open)
    }

    /// Run `f` now if the gate is open, otherwise queue it to run at the
    /// moment of transition. Queued callbacks run in registration order;
    /// none is dropped or run twice.
    pub fn on_ready(&self, f: impl FnOnce() + Send + 'static) {
        let mut state = self.lock();
        match &mut *state {
            GateState::Open => {
                drop(state);
                f();
            }
            GateState::Pending(queue) => queue.push(Box::new(f)),
        }
    }

    /// Transition to open and drain the queue in FIFO order. Idempotent:
    /// later calls have no additional effect.
    pub fn open(&self) {
        let drained = {
            let mut state = self.lock();
            match mem::replace(&mut *state, GateState::Open) {
                GateState::Pending(queue) => queue,
                GateState::Open => Vec::new(),
            }
        };
        // Outside the lock, so a callback may register more work on the
        // now-open gate.
        for f in drained {
            f();
        }
    }

    /// Suspend the caller until the gate is open. Returns immediately if
    /// it already is.
    pub async fn wait(&self) {
        let (tx, rx) = oneshot::channel();
        self.on_ready(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        // A poisoned queue is still drainable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
