//! One-shot awaitables.
//!
//! A `Deferred` is the promise-like the interpreter accepts directly: an
//! awaitable with completion callbacks and an optional cancel hook. The
//! first settle wins; later settles and cancels are no-ops.

use std::sync::{Arc, Mutex};

use crate::error::TaskError;
use crate::value::Value;

type Waiter = Box<dyn FnOnce(Result<Value, TaskError>) + Send>;

enum DeferredState {
    Pending {
        waiters: Vec<Waiter>,
        on_cancel: Option<Box<dyn FnOnce() + Send>>,
    },
    Settled(Result<Value, TaskError>),
}

/// A shareable one-shot awaitable.
#[derive(Clone)]
pub struct Deferred {
    state: Arc<Mutex<DeferredState>>,
}

impl Deferred {
    pub fn new() -> Self {
        Deferred {
            state: Arc::new(Mutex::new(DeferredState::Pending {
                waiters: Vec::new(),
                on_cancel: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeferredState> {
        self.state.lock().expect("deferred lock poisoned")
    }

    pub fn resolve(&self, value: Value) {
        self.settle(Ok(value));
    }

    pub fn reject(&self, error: TaskError) {
        self.settle(Err(error));
    }

    pub fn settle(&self, result: Result<Value, TaskError>) {
        let waiters = {
            let mut state = self.lock();
            match &mut *state {
                DeferredState::Pending { waiters, .. } => {
                    let waiters = std::mem::take(waiters);
                    *state = DeferredState::Settled(result.clone());
                    waiters
                }
                DeferredState::Settled(_) => return,
            }
        };
        for waiter in waiters {
            waiter(result.clone());
        }
    }

    /// Register a completion callback; fires immediately if already settled.
    pub fn on_settle(&self, f: impl FnOnce(Result<Value, TaskError>) + Send + 'static) {
        let mut f = Some(f);
        let settled = {
            let mut state = self.lock();
            match &mut *state {
                DeferredState::Pending { waiters, .. } => {
                    if let Some(f) = f.take() {
                        waiters.push(Box::new(f));
                    }
                    None
                }
                DeferredState::Settled(result) => Some(result.clone()),
            }
        };
        if let (Some(result), Some(f)) = (settled, f) {
            f(result);
        }
    }

    /// Install the cancel hook. Replaced wholesale if called twice.
    pub fn set_on_cancel(&self, f: impl FnOnce() + Send + 'static) {
        if let DeferredState::Pending { on_cancel, .. } = &mut *self.lock() {
            *on_cancel = Some(Box::new(f));
        }
    }

    /// Invoke the cancel hook if still pending. Whether cancellation settles
    /// the deferred is up to the hook; a hook-less deferred just dangles,
    /// which the interpreter's exactly-once wrapping tolerates.
    pub fn cancel(&self) {
        let hook = {
            match &mut *self.lock() {
                DeferredState::Pending { on_cancel, .. } => on_cancel.take(),
                DeferredState::Settled(_) => None,
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.lock(), DeferredState::Settled(_))
    }

    pub fn result(&self) -> Option<Result<Value, TaskError>> {
        match &*self.lock() {
            DeferredState::Settled(result) => Some(result.clone()),
            DeferredState::Pending { .. } => None,
        }
    }

    pub fn ptr_eq(&self, other: &Deferred) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Default for Deferred {
    fn default() -> Self {
        Deferred::new()
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock() {
            DeferredState::Pending { .. } => "pending",
            DeferredState::Settled(Ok(_)) => "resolved",
            DeferredState::Settled(Err(_)) => "rejected",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_fires_waiters_once() {
        let d = Deferred::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        d.on_settle({
            let seen = seen.clone();
            move |r| seen.lock().unwrap().push(r)
        });
        d.resolve(Value::Int(1));
        d.resolve(Value::Int(2));
        assert_eq!(*seen.lock().unwrap(), vec![Ok(Value::Int(1))]);
    }

    #[test]
    fn test_late_waiter_fires_immediately() {
        let d = Deferred::new();
        d.reject(TaskError::new("boom"));
        let seen = Arc::new(Mutex::new(None));
        d.on_settle({
            let seen = seen.clone();
            move |r| *seen.lock().unwrap() = Some(r)
        });
        assert_eq!(*seen.lock().unwrap(), Some(Err(TaskError::new("boom"))));
    }

    #[test]
    fn test_cancel_hook_fires_only_while_pending() {
        let d = Deferred::new();
        let fired = Arc::new(Mutex::new(0));
        d.set_on_cancel({
            let fired = fired.clone();
            move || *fired.lock().unwrap() += 1
        });
        d.resolve(Value::Unit);
        d.cancel();
        assert_eq!(*fired.lock().unwrap(), 0);

        let d = Deferred::new();
        d.set_on_cancel({
            let fired = fired.clone();
            move || *fired.lock().unwrap() += 1
        });
        d.cancel();
        d.cancel();
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn test_result_reads_back() {
        let d = Deferred::new();
        assert!(d.result().is_none());
        d.resolve(Value::Int(9));
        assert_eq!(d.result(), Some(Ok(Value::Int(9))));
        assert!(d.is_settled());
    }
}
