//! Higher-level watcher combinators built from take and fork.
//!
//! Each helper is an attached fork running a small watcher state machine.
//! They terminate when the std channel closes, and cancel like any forked
//! procedure. Time-based combinators are deliberately absent: the runtime
//! has no timer primitive, timeouts are expressed as a race against a
//! user-supplied timer effect.

use std::sync::Arc;

use crate::effect::{take, Effect, ForkFn};
use crate::error::TaskError;
use crate::matcher::Pattern;
use crate::program::{ProgramBox, ProgramInput, ProgramStep, SagaProgram, Yielded};
use crate::task::Task;
use crate::value::Value;

fn fork_fn<F>(f: F) -> ForkFn
where
    F: Fn(Vec<Value>) -> Result<ProgramBox, TaskError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Fork a worker for every action matching `pattern`.
pub fn take_every<F>(pattern: impl Into<Pattern>, worker_name: impl Into<String>, worker: F) -> Effect
where
    F: Fn(Vec<Value>) -> Result<ProgramBox, TaskError> + Send + Sync + 'static,
{
    let pattern = pattern.into();
    let worker_name = worker_name.into();
    let worker = fork_fn(worker);
    Effect::Fork {
        name: format!("takeEvery({:?})", pattern),
        f: Arc::new(move |_args| {
            Ok(Box::new(TakeEvery {
                pattern: pattern.clone(),
                worker_name: worker_name.clone(),
                worker: worker.clone(),
                phase: WatcherPhase::Init,
            }) as ProgramBox)
        }),
        args: Vec::new(),
        detached: false,
    }
}

/// Fork a worker per matching action, cancelling the previous worker first
/// if it is still running.
pub fn take_latest<F>(pattern: impl Into<Pattern>, worker_name: impl Into<String>, worker: F) -> Effect
where
    F: Fn(Vec<Value>) -> Result<ProgramBox, TaskError> + Send + Sync + 'static,
{
    let pattern = pattern.into();
    let worker_name = worker_name.into();
    let worker = fork_fn(worker);
    Effect::Fork {
        name: format!("takeLatest({:?})", pattern),
        f: Arc::new(move |_args| {
            Ok(Box::new(TakeLatest {
                pattern: pattern.clone(),
                worker_name: worker_name.clone(),
                worker: worker.clone(),
                last: None,
                phase: LatestPhase::Init,
            }) as ProgramBox)
        }),
        args: Vec::new(),
        detached: false,
    }
}

/// Run a worker to completion per matching action, ignoring actions that
/// arrive while it is busy.
pub fn take_leading<F>(pattern: impl Into<Pattern>, worker_name: impl Into<String>, worker: F) -> Effect
where
    F: Fn(Vec<Value>) -> Result<ProgramBox, TaskError> + Send + Sync + 'static,
{
    let pattern = pattern.into();
    let worker_name = worker_name.into();
    let worker = fork_fn(worker);
    Effect::Fork {
        name: format!("takeLeading({:?})", pattern),
        f: Arc::new(move |_args| {
            Ok(Box::new(TakeLeading {
                pattern: pattern.clone(),
                worker: worker.clone(),
                watcher_name: format!("takeLeading({})", worker_name),
                phase: WatcherPhase::Init,
            }) as ProgramBox)
        }),
        args: Vec::new(),
        detached: false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatcherPhase {
    Init,
    Taking,
    Working,
}

struct TakeEvery {
    pattern: Pattern,
    worker_name: String,
    worker: ForkFn,
    phase: WatcherPhase,
}

impl SagaProgram for TakeEvery {
    fn resume(&mut self, input: ProgramInput) -> ProgramStep {
        let value = match input {
            ProgramInput::Finish(v) => return ProgramStep::Return(v),
            ProgramInput::Throw(e) => return ProgramStep::Throw(e),
            ProgramInput::Next(v) => v,
        };
        match self.phase {
            WatcherPhase::Init | WatcherPhase::Working => {
                self.phase = WatcherPhase::Taking;
                ProgramStep::Yield(take(self.pattern.clone()).into())
            }
            WatcherPhase::Taking => {
                self.phase = WatcherPhase::Working;
                ProgramStep::Yield(
                    Effect::Fork {
                        name: self.worker_name.clone(),
                        f: self.worker.clone(),
                        args: vec![value],
                        detached: false,
                    }
                    .into(),
                )
            }
        }
    }

    fn name(&self) -> &str {
        "takeEvery"
    }
}

enum LatestPhase {
    Init,
    Taking,
    Cancelling { action: Value },
    Forking,
}

struct TakeLatest {
    pattern: Pattern,
    worker_name: String,
    worker: ForkFn,
    last: Option<Task>,
    phase: LatestPhase,
}

impl SagaProgram for TakeLatest {
    fn resume(&mut self, input: ProgramInput) -> ProgramStep {
        let value = match input {
            ProgramInput::Finish(v) => return ProgramStep::Return(v),
            ProgramInput::Throw(e) => return ProgramStep::Throw(e),
            ProgramInput::Next(v) => v,
        };
        loop {
            match std::mem::replace(&mut self.phase, LatestPhase::Init) {
                LatestPhase::Init => {
                    self.phase = LatestPhase::Taking;
                    return ProgramStep::Yield(take(self.pattern.clone()).into());
                }
                LatestPhase::Taking => {
                    if let Some(last) = self.last.take() {
                        self.phase = LatestPhase::Cancelling {
                            action: value.clone(),
                        };
                        return ProgramStep::Yield(crate::effect::cancel(last).into());
                    }
                    self.phase = LatestPhase::Cancelling {
                        action: value.clone(),
                    };
                    // no previous worker: fall through to forking
                    continue;
                }
                LatestPhase::Cancelling { action } => {
                    self.phase = LatestPhase::Forking;
                    return ProgramStep::Yield(
                        Effect::Fork {
                            name: self.worker_name.clone(),
                            f: self.worker.clone(),
                            args: vec![action],
                            detached: false,
                        }
                        .into(),
                    );
                }
                LatestPhase::Forking => {
                    if let Value::Task(t) = &value {
                        self.last = Some(t.clone());
                    }
                    self.phase = LatestPhase::Taking;
                    return ProgramStep::Yield(take(self.pattern.clone()).into());
                }
            }
        }
    }

    fn name(&self) -> &str {
        "takeLatest"
    }
}

struct TakeLeading {
    pattern: Pattern,
    watcher_name: String,
    worker: ForkFn,
    phase: WatcherPhase,
}

impl SagaProgram for TakeLeading {
    fn resume(&mut self, input: ProgramInput) -> ProgramStep {
        let value = match input {
            ProgramInput::Finish(v) => return ProgramStep::Return(v),
            ProgramInput::Throw(e) => return ProgramStep::Throw(e),
            ProgramInput::Next(v) => v,
        };
        match self.phase {
            WatcherPhase::Init | WatcherPhase::Working => {
                self.phase = WatcherPhase::Taking;
                ProgramStep::Yield(take(self.pattern.clone()).into())
            }
            WatcherPhase::Taking => {
                self.phase = WatcherPhase::Working;
                // run the worker in place: nothing is taken until it ends
                match (self.worker)(vec![value]) {
                    Ok(program) => ProgramStep::Yield(Yielded::Program(program)),
                    Err(e) => ProgramStep::Throw(e),
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.watcher_name
    }
}
