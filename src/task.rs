//! Task handles and per-task context.
//!
//! A `Task` is the externally observable representation of a running
//! procedure: status, result, joiners, cancellation. The `MainTask` is the
//! interpreter-internal record for the driving program itself; it sits in
//! the fork queue next to the forked children.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::callback::EffectCallback;
use crate::deferred::Deferred;
use crate::error::TaskError;
use crate::ids::{TakerId, TaskId};
use crate::value::Value;

/// Lifecycle of a task.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskStatus {
    Running,
    Done,
    Aborted,
    Cancelled,
}

/// Continuation invoked exactly once when a task terminates.
pub(crate) type TaskCont = Box<dyn FnOnce(Result<Value, TaskError>) + Send>;

struct Joiner {
    id: TakerId,
    cb: EffectCallback,
}

struct TaskState {
    status: TaskStatus,
    result: Option<Value>,
    error: Option<TaskError>,
    /// Some while running; taken at termination.
    joiners: Option<Vec<Joiner>>,
    cont: Option<TaskCont>,
    deferred_end: Option<Deferred>,
    cancel_hook: Option<Box<dyn FnOnce() + Send>>,
    ended: bool,
}

struct TaskInner {
    id: TaskId,
    name: String,
    is_root: bool,
    context: TaskContext,
    state: Mutex<TaskState>,
}

/// Shareable handle to a running or finished procedure.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub(crate) fn new(name: impl Into<String>, is_root: bool, context: TaskContext) -> Self {
        Task {
            inner: Arc::new(TaskInner {
                id: TaskId::fresh(),
                name: name.into(),
                is_root,
                context,
                state: Mutex::new(TaskState {
                    status: TaskStatus::Running,
                    result: None,
                    error: None,
                    joiners: Some(Vec::new()),
                    cont: None,
                    deferred_end: None,
                    cancel_hook: None,
                    ended: false,
                }),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskState> {
        self.inner.state.lock().expect("task lock poisoned")
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_root
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == TaskStatus::Cancelled
    }

    pub fn is_aborted(&self) -> bool {
        self.status() == TaskStatus::Aborted
    }

    pub fn result(&self) -> Option<Value> {
        self.lock().result.clone()
    }

    pub fn error(&self) -> Option<TaskError> {
        self.lock().error.clone()
    }

    pub fn context(&self) -> &TaskContext {
        &self.inner.context
    }

    /// Merge entries into this task's own context layer.
    pub fn set_context(&self, entries: impl IntoIterator<Item = (String, Value)>) {
        self.inner.context.extend(entries);
    }

    /// Cancel this task: propagates down the fork tree, then terminates the
    /// handle with `Value::TaskCancel`. Idempotent; a no-op on a terminal
    /// task.
    pub fn cancel(&self) {
        let hook = {
            let mut state = self.lock();
            if state.status != TaskStatus::Running {
                return;
            }
            state.status = TaskStatus::Cancelled;
            state.cancel_hook.take()
        };
        if let Some(hook) = hook {
            hook();
        }
        self.end(Ok(Value::TaskCancel));
    }

    /// Lazily allocate the one-shot awaitable bound to this task's final
    /// status.
    pub fn to_deferred(&self) -> Deferred {
        let (deferred, settle_now) = {
            let mut state = self.lock();
            if let Some(d) = &state.deferred_end {
                (d.clone(), None)
            } else {
                let d = Deferred::new();
                let settle = match state.status {
                    TaskStatus::Running => {
                        state.deferred_end = Some(d.clone());
                        None
                    }
                    TaskStatus::Aborted => {
                        Some(Err(state.error.clone().unwrap_or_else(|| {
                            TaskError::new("task aborted")
                        })))
                    }
                    _ => Some(Ok(state.result.clone().unwrap_or(Value::Unit))),
                };
                (d, settle)
            }
        };
        if let Some(outcome) = settle_now {
            deferred.settle(outcome);
        }
        deferred
    }

    /// Terminate the handle: record the outcome, settle the awaitable, fire
    /// the continuation and every joiner. Only the first call has effect.
    pub(crate) fn end(&self, outcome: Result<Value, TaskError>) {
        let (cont, joiners, deferred) = {
            let mut state = self.lock();
            if state.ended {
                return;
            }
            state.ended = true;
            match &outcome {
                Ok(v) => {
                    if *v == Value::TaskCancel {
                        state.status = TaskStatus::Cancelled;
                    } else if state.status != TaskStatus::Cancelled {
                        state.status = TaskStatus::Done;
                    }
                    state.result = Some(v.clone());
                }
                Err(e) => {
                    state.status = TaskStatus::Aborted;
                    state.error = Some(e.clone());
                }
            }
            (
                state.cont.take(),
                state.joiners.take(),
                state.deferred_end.clone(),
            )
        };
        if let Some(d) = deferred {
            d.settle(outcome.clone());
        }
        if let Some(cont) = cont {
            cont(outcome.clone());
        }
        for joiner in joiners.unwrap_or_default() {
            joiner.cb.deliver(outcome.clone());
        }
    }

    pub(crate) fn set_cont(&self, cont: TaskCont) {
        self.lock().cont = Some(cont);
    }

    pub(crate) fn clear_cont(&self) {
        self.lock().cont = None;
    }

    pub(crate) fn set_cancel_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        self.lock().cancel_hook = Some(hook);
    }

    /// Register a peer awaiting this task's terminal value. Returns None if
    /// the task has already terminated.
    pub(crate) fn try_add_joiner(&self, cb: EffectCallback) -> Option<TakerId> {
        let mut state = self.lock();
        match &mut state.joiners {
            Some(joiners) => {
                let id = TakerId::fresh();
                joiners.push(Joiner { id, cb });
                Some(id)
            }
            None => None,
        }
    }

    pub(crate) fn remove_joiner(&self, id: TakerId) {
        if let Some(joiners) = &mut self.lock().joiners {
            joiners.retain(|j| j.id != id);
        }
    }

    /// Terminal outcome, if any.
    pub(crate) fn outcome(&self) -> Option<Result<Value, TaskError>> {
        let state = self.lock();
        match state.status {
            TaskStatus::Running => None,
            TaskStatus::Aborted => Some(Err(state
                .error
                .clone()
                .unwrap_or_else(|| TaskError::new("task aborted")))),
            _ => Some(Ok(state.result.clone().unwrap_or(Value::Unit))),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id.raw())
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Main task: the fork-queue member representing the driving program
// ---------------------------------------------------------------------------

struct MainState {
    status: TaskStatus,
    cont: Option<TaskCont>,
    cancel_hook: Option<Box<dyn FnOnce() + Send>>,
}

#[derive(Clone)]
pub(crate) struct MainTask {
    name: String,
    state: Arc<Mutex<MainState>>,
}

impl MainTask {
    pub fn new(name: impl Into<String>) -> Self {
        MainTask {
            name: name.into(),
            state: Arc::new(Mutex::new(MainState {
                status: TaskStatus::Running,
                cont: None,
                cancel_hook: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MainState> {
        self.state.lock().expect("main task lock poisoned")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == TaskStatus::Cancelled
    }

    /// Terminated means finished or failed; a cancelled main task is still
    /// advancing through its cleanup arms.
    pub fn is_terminated(&self) -> bool {
        matches!(self.status(), TaskStatus::Done | TaskStatus::Aborted)
    }

    pub fn set_cancelled(&self) {
        let mut state = self.lock();
        if state.status == TaskStatus::Running {
            state.status = TaskStatus::Cancelled;
        }
    }

    /// Cancel the driving program: resumes it once with the cancellation
    /// signal via the installed hook.
    pub fn cancel(&self) {
        let hook = {
            let mut state = self.lock();
            if state.status != TaskStatus::Running {
                return;
            }
            state.status = TaskStatus::Cancelled;
            state.cancel_hook.take()
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn set_cancel_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        self.lock().cancel_hook = Some(hook);
    }

    pub fn set_cont(&self, cont: TaskCont) {
        self.lock().cont = Some(cont);
    }

    pub fn clear_cont(&self) {
        self.lock().cont = None;
    }

    /// The driving program finished: fix the final status and report to the
    /// fork queue.
    pub fn complete(&self, outcome: Result<Value, TaskError>) {
        let cont = {
            let mut state = self.lock();
            match &outcome {
                Ok(_) => {
                    if state.status != TaskStatus::Cancelled {
                        state.status = TaskStatus::Done;
                    }
                }
                Err(_) => state.status = TaskStatus::Aborted,
            }
            state.cont.take()
        };
        if let Some(cont) = cont {
            cont(outcome);
        }
    }
}

impl std::fmt::Debug for MainTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainTask")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Task context: layered key/value mapping inherited by children
// ---------------------------------------------------------------------------

struct ContextInner {
    parent: Option<TaskContext>,
    entries: Mutex<HashMap<String, Value>>,
}

/// String-keyed mapping with parent layering: a child sees its own keys
/// plus its parent's, and child writes are invisible to the parent.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

impl TaskContext {
    pub fn new() -> Self {
        TaskContext {
            inner: Arc::new(ContextInner {
                parent: None,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A fresh layer over this context.
    pub fn child(&self) -> Self {
        TaskContext {
            inner: Arc::new(ContextInner {
                parent: Some(self.clone()),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let own = {
            self.inner
                .entries
                .lock()
                .expect("context lock poisoned")
                .get(key)
                .cloned()
        };
        match own {
            Some(v) => Some(v),
            None => self.inner.parent.as_ref().and_then(|p| p.get(key)),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner
            .entries
            .lock()
            .expect("context lock poisoned")
            .insert(key.into(), value);
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = (String, Value)>) {
        let mut own = self.inner.entries.lock().expect("context lock poisoned");
        for (k, v) in entries {
            own.insert(k, v);
        }
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        TaskContext::new()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext").finish_non_exhaustive()
    }
}
