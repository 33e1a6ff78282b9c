//! Effect descriptors and their factory helpers.
//!
//! An effect is a declarative request a procedure yields to the runtime;
//! the runtime, not the procedure, performs the I/O or control action.
//! Descriptors are a closed tagged sum: the interpreter dispatches on the
//! variant, never on open inheritance.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::callback::EffectCallback;
use crate::channel::ChannelRef;
use crate::error::TaskError;
use crate::matcher::Pattern;
use crate::program::{ProgramBox, Yielded};
use crate::task::Task;
use crate::value::{Action, Value};

/// What a `call` target can produce: a synchronous value, an awaitable to
/// chain, or a nested procedure to run in place.
pub enum CallOutcome {
    Value(Value),
    Deferred(crate::deferred::Deferred),
    Program(ProgramBox),
}

/// Synchronous callable behind a `call` effect.
pub type CallFn = Arc<dyn Fn(Vec<Value>) -> Result<CallOutcome, TaskError> + Send + Sync>;

/// Node-style callable behind a `cps` effect. Receives its completion
/// callback as the last argument; an `Err` return models a synchronous
/// throw.
pub type CpsFn = Arc<dyn Fn(Vec<Value>, CpsCallback) -> Result<(), TaskError> + Send + Sync>;

/// Factory behind fork/spawn: builds the child procedure. An `Err` return
/// surfaces through the child task rather than at the fork site.
pub type ForkFn = Arc<dyn Fn(Vec<Value>) -> Result<ProgramBox, TaskError> + Send + Sync>;

/// Selector over the host state behind a `select` effect.
pub type SelectFn = Arc<dyn Fn(&Value, &[Value]) -> Result<Value, TaskError> + Send + Sync>;

/// Target of a cancel effect.
#[derive(Clone, Debug)]
pub enum CancelTarget {
    /// Cancel the issuing task itself.
    Own,
    One(Task),
    Many(Vec<Task>),
}

/// Shape of an all/race fan-out: positional or named.
pub enum ComboShape {
    List(Vec<Yielded>),
    Named(Vec<(String, Yielded)>),
}

impl ComboShape {
    pub fn len(&self) -> usize {
        match self {
            ComboShape::List(items) => items.len(),
            ComboShape::Named(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The completion handle passed to a `cps` callable.
#[derive(Clone)]
pub struct CpsCallback {
    cb: EffectCallback,
}

impl CpsCallback {
    pub(crate) fn new(cb: EffectCallback) -> Self {
        CpsCallback { cb }
    }

    pub fn resolve(&self, value: Value) {
        self.cb.resolve(value);
    }

    pub fn reject(&self, error: TaskError) {
        self.cb.reject(error);
    }

    pub fn done(&self, result: Result<Value, TaskError>) {
        self.cb.deliver(result);
    }

    /// Expose a cancel hook: runs if the surrounding effect is cancelled
    /// before completion.
    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) {
        self.cb.set_cancel(Box::new(f));
    }
}

impl std::fmt::Debug for CpsCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpsCallback").finish_non_exhaustive()
    }
}

/// An effect descriptor.
pub enum Effect {
    /// Wait for a matching input on a channel (default: the std channel).
    /// Without `maybe`, a closed channel terminates the procedure.
    Take {
        channel: Option<ChannelRef>,
        pattern: Pattern,
        maybe: bool,
    },
    /// Deliver a value into a channel, or dispatch an action (no channel).
    /// With `resolve`, an awaitable dispatch result is chained.
    Put {
        channel: Option<ChannelRef>,
        value: Value,
        resolve: bool,
    },
    /// Invoke a callable synchronously; awaitables and nested procedures
    /// returned by it are chained.
    Call {
        name: String,
        f: CallFn,
        args: Vec<Value>,
    },
    /// Invoke a node-style callable.
    Cps {
        name: String,
        f: CpsFn,
        args: Vec<Value>,
    },
    /// Start a child procedure. Attached children couple their lifecycle to
    /// the parent; detached ones are independent roots.
    Fork {
        name: String,
        f: ForkFn,
        args: Vec<Value>,
        detached: bool,
    },
    /// Wait for another task's terminal value.
    Join { task: Task },
    /// Cancel a task (or the issuing task itself).
    Cancel { target: CancelTarget },
    /// Read from the host state through a selector.
    Select {
        name: String,
        f: SelectFn,
        args: Vec<Value>,
    },
    /// Create a buffered channel mirroring every std-channel input matching
    /// the pattern.
    ActionChannel {
        pattern: Pattern,
        buffer: Option<Buffer>,
    },
    /// Drain a buffered channel.
    Flush { channel: ChannelRef },
    /// Whether the enclosing procedure has been cancelled.
    Cancelled,
    GetContext { key: String },
    SetContext { entries: Vec<(String, Value)> },
    /// Fan out; succeed when every entry has succeeded, preserving shape.
    All { shape: ComboShape },
    /// Fan out; succeed with the first entry to complete, cancelling the
    /// losers.
    Race { shape: ComboShape },
}

impl Effect {
    /// Short single-line description for diagnostics and traces.
    pub fn describe(&self) -> String {
        match self {
            Effect::Take { pattern, maybe, .. } => {
                if *maybe {
                    format!("takeMaybe({:?})", pattern)
                } else {
                    format!("take({:?})", pattern)
                }
            }
            Effect::Put { channel, value, .. } => match channel {
                Some(_) => format!("put(channel, {})", value.describe()),
                None => format!("put({})", value.describe()),
            },
            Effect::Call { name, .. } => format!("call({})", name),
            Effect::Cps { name, .. } => format!("cps({})", name),
            Effect::Fork { name, detached, .. } => {
                if *detached {
                    format!("spawn({})", name)
                } else {
                    format!("fork({})", name)
                }
            }
            Effect::Join { task } => format!("join({})", task.name()),
            Effect::Cancel { target } => match target {
                CancelTarget::Own => "cancel(self)".to_string(),
                CancelTarget::One(t) => format!("cancel({})", t.name()),
                CancelTarget::Many(ts) => format!("cancel({} tasks)", ts.len()),
            },
            Effect::Select { name, .. } => format!("select({})", name),
            Effect::ActionChannel { pattern, .. } => format!("actionChannel({:?})", pattern),
            Effect::Flush { .. } => "flush(channel)".to_string(),
            Effect::Cancelled => "cancelled()".to_string(),
            Effect::GetContext { key } => format!("getContext({})", key),
            Effect::SetContext { .. } => "setContext".to_string(),
            Effect::All { shape } => format!("all({} effects)", shape.len()),
            Effect::Race { shape } => format!("race({} effects)", shape.len()),
        }
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Effect({})", self.describe())
    }
}

// ---------------------------------------------------------------------------
// Factory helpers
// ---------------------------------------------------------------------------

pub fn take(pattern: impl Into<Pattern>) -> Effect {
    Effect::Take {
        channel: None,
        pattern: pattern.into(),
        maybe: false,
    }
}

/// Take that delivers the END envelope itself instead of terminating the
/// procedure when the channel closes.
pub fn take_maybe(pattern: impl Into<Pattern>) -> Effect {
    Effect::Take {
        channel: None,
        pattern: pattern.into(),
        maybe: true,
    }
}

pub fn take_from(channel: impl Into<ChannelRef>, pattern: impl Into<Pattern>) -> Effect {
    Effect::Take {
        channel: Some(channel.into()),
        pattern: pattern.into(),
        maybe: false,
    }
}

pub fn put(action: Action) -> Effect {
    Effect::Put {
        channel: None,
        value: Value::Action(action),
        resolve: false,
    }
}

/// Put whose awaitable dispatch result is chained before resuming.
pub fn put_resolve(action: Action) -> Effect {
    Effect::Put {
        channel: None,
        value: Value::Action(action),
        resolve: true,
    }
}

pub fn put_to(channel: impl Into<ChannelRef>, value: Value) -> Effect {
    Effect::Put {
        channel: Some(channel.into()),
        value,
        resolve: false,
    }
}

pub fn call<F>(name: impl Into<String>, f: F, args: Vec<Value>) -> Effect
where
    F: Fn(Vec<Value>) -> Result<CallOutcome, TaskError> + Send + Sync + 'static,
{
    Effect::Call {
        name: name.into(),
        f: Arc::new(f),
        args,
    }
}

pub fn cps<F>(name: impl Into<String>, f: F, args: Vec<Value>) -> Effect
where
    F: Fn(Vec<Value>, CpsCallback) -> Result<(), TaskError> + Send + Sync + 'static,
{
    Effect::Cps {
        name: name.into(),
        f: Arc::new(f),
        args,
    }
}

pub fn fork<F>(name: impl Into<String>, f: F, args: Vec<Value>) -> Effect
where
    F: Fn(Vec<Value>) -> Result<ProgramBox, TaskError> + Send + Sync + 'static,
{
    Effect::Fork {
        name: name.into(),
        f: Arc::new(f),
        args,
        detached: false,
    }
}

pub fn spawn<F>(name: impl Into<String>, f: F, args: Vec<Value>) -> Effect
where
    F: Fn(Vec<Value>) -> Result<ProgramBox, TaskError> + Send + Sync + 'static,
{
    Effect::Fork {
        name: name.into(),
        f: Arc::new(f),
        args,
        detached: true,
    }
}

pub fn join(task: Task) -> Effect {
    Effect::Join { task }
}

/// Join several tasks at once; completes when all have, as an `all`.
pub fn join_all(tasks: Vec<Task>) -> Effect {
    Effect::All {
        shape: ComboShape::List(tasks.into_iter().map(|t| join(t).into()).collect()),
    }
}

pub fn cancel(task: Task) -> Effect {
    Effect::Cancel {
        target: CancelTarget::One(task),
    }
}

/// Cancel the issuing task.
pub fn cancel_self() -> Effect {
    Effect::Cancel {
        target: CancelTarget::Own,
    }
}

pub fn cancel_tasks(tasks: Vec<Task>) -> Effect {
    Effect::Cancel {
        target: CancelTarget::Many(tasks),
    }
}

pub fn select<F>(name: impl Into<String>, f: F, args: Vec<Value>) -> Effect
where
    F: Fn(&Value, &[Value]) -> Result<Value, TaskError> + Send + Sync + 'static,
{
    Effect::Select {
        name: name.into(),
        f: Arc::new(f),
        args,
    }
}

pub fn action_channel(pattern: impl Into<Pattern>, buffer: Option<Buffer>) -> Effect {
    Effect::ActionChannel {
        pattern: pattern.into(),
        buffer,
    }
}

pub fn flush(channel: impl Into<ChannelRef>) -> Effect {
    Effect::Flush {
        channel: channel.into(),
    }
}

pub fn cancelled() -> Effect {
    Effect::Cancelled
}

pub fn get_context(key: impl Into<String>) -> Effect {
    Effect::GetContext { key: key.into() }
}

pub fn set_context(entries: Vec<(String, Value)>) -> Effect {
    Effect::SetContext { entries }
}

pub fn all(effects: Vec<Yielded>) -> Effect {
    Effect::All {
        shape: ComboShape::List(effects),
    }
}

pub fn all_named(effects: Vec<(String, Yielded)>) -> Effect {
    Effect::All {
        shape: ComboShape::Named(effects),
    }
}

pub fn race(effects: Vec<Yielded>) -> Effect {
    Effect::Race {
        shape: ComboShape::List(effects),
    }
}

pub fn race_named(effects: Vec<(String, Yielded)>) -> Effect {
    Effect::Race {
        shape: ComboShape::Named(effects),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_is_stable() {
        assert_eq!(take("PING").describe(), "take(\"PING\")");
        assert_eq!(put(Action::new("PING")).describe(), "put(action(PING))");
        assert_eq!(cancel_self().describe(), "cancel(self)");
        assert_eq!(cancelled().describe(), "cancelled()");
        assert_eq!(
            all(vec![cancelled().into(), cancelled().into()]).describe(),
            "all(2 effects)"
        );
    }

    #[test]
    fn test_take_maybe_flag() {
        assert!(matches!(take_maybe("A"), Effect::Take { maybe: true, .. }));
        assert!(matches!(take("A"), Effect::Take { maybe: false, .. }));
    }

    #[test]
    fn test_join_all_builds_all_shape() {
        let effect = join_all(vec![]);
        match effect {
            Effect::All { shape } => assert!(shape.is_empty()),
            _ => panic!("expected all"),
        }
    }

    #[test]
    fn test_spawn_is_detached_fork() {
        let e = spawn("s", |_| Err(TaskError::new("nope")), vec![]);
        assert!(matches!(e, Effect::Fork { detached: true, .. }));
    }
}
