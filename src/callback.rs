//! Completion callbacks for pending effects.
//!
//! An `EffectCallback` pairs a delivery function with a swappable cancel
//! slot. The interpreter wraps every digested effect so that completion and
//! cancellation race safely: the exactly-once discipline lives in the
//! wrapping closures, the slot here is just the mechanism they cascade
//! through.

use std::sync::{Arc, Mutex};

use crate::error::TaskError;
use crate::value::Value;

/// Outcome delivered to a pending effect.
pub(crate) type EffectResult = Result<Value, TaskError>;

/// Delivery function of a callback. Shared and re-entrant: delivering may
/// synchronously advance a program that digests further effects.
pub(crate) type DeliverFn = Arc<dyn Fn(EffectResult) + Send + Sync>;

/// A cancel hook installed by whatever is currently servicing the effect
/// (remove a taker, cancel a child task, abort a deferred). Consumed on use.
pub(crate) type CancelFn = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub(crate) struct EffectCallback {
    deliver: DeliverFn,
    canceller: Arc<Mutex<Option<CancelFn>>>,
}

impl EffectCallback {
    pub fn new(deliver: DeliverFn) -> Self {
        EffectCallback {
            deliver,
            canceller: Arc::new(Mutex::new(None)),
        }
    }

    /// Build a callback around an existing cancel slot. The interpreter's
    /// driver keeps one slot alive across all the effects it digests; each
    /// digest re-points it at the newly pending effect.
    pub fn with_slot(deliver: DeliverFn, canceller: Arc<Mutex<Option<CancelFn>>>) -> Self {
        EffectCallback { deliver, canceller }
    }

    pub fn deliver(&self, result: EffectResult) {
        (self.deliver)(result);
    }

    pub fn resolve(&self, value: Value) {
        self.deliver(Ok(value));
    }

    pub fn reject(&self, error: TaskError) {
        self.deliver(Err(error));
    }

    /// Consume and invoke the installed cancel hook, if any.
    pub fn cancel(&self) {
        let hook = self.take_canceller();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn set_cancel(&self, hook: CancelFn) {
        *self.lock_canceller() = Some(hook);
    }

    pub fn clear_cancel(&self) {
        *self.lock_canceller() = None;
    }

    fn take_canceller(&self) -> Option<CancelFn> {
        self.lock_canceller().take()
    }

    fn lock_canceller(&self) -> std::sync::MutexGuard<'_, Option<CancelFn>> {
        self.canceller.lock().expect("callback cancel slot poisoned")
    }
}

impl std::fmt::Debug for EffectCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectCallback").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_routes_to_function() {
        let seen = Arc::new(Mutex::new(None));
        let cb = EffectCallback::new(Arc::new({
            let seen = seen.clone();
            move |res| *seen.lock().unwrap() = Some(res)
        }));
        cb.resolve(Value::Int(7));
        assert_eq!(*seen.lock().unwrap(), Some(Ok(Value::Int(7))));
    }

    #[test]
    fn test_cancel_consumes_hook() {
        let fired = Arc::new(Mutex::new(0));
        let cb = EffectCallback::new(Arc::new(|_| {}));
        cb.set_cancel(Box::new({
            let fired = fired.clone();
            move || *fired.lock().unwrap() += 1
        }));
        cb.cancel();
        cb.cancel();
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn test_cancel_without_hook_is_noop() {
        let cb = EffectCallback::new(Arc::new(|_| {}));
        cb.cancel();
    }

    #[test]
    fn test_replacing_hook_drops_old() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let cb = EffectCallback::new(Arc::new(|_| {}));
        cb.set_cancel(Box::new({
            let fired = fired.clone();
            move || fired.lock().unwrap().push("old")
        }));
        cb.set_cancel(Box::new({
            let fired = fired.clone();
            move || fired.lock().unwrap().push("new")
        }));
        cb.cancel();
        assert_eq!(*fired.lock().unwrap(), vec!["new"]);
    }
}
