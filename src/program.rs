//! The coroutine protocol between user procedures and the interpreter.
//!
//! A procedure is an explicit continuation record: the interpreter calls
//! `resume` with an input (a value, an injected error, or a finish signal)
//! and receives either the next yielded item, a return value, or a thrown
//! error. This mirrors a generator's next/throw/return surface.

use crate::deferred::Deferred;
use crate::effect::Effect;
use crate::error::TaskError;
use crate::value::Value;

/// What the interpreter injects into a suspended procedure.
#[derive(Debug)]
pub enum ProgramInput {
    /// Resume with the completed effect's value. The very first resume of a
    /// program carries `Value::Unit`.
    Next(Value),
    /// Resume by throwing: the pending effect failed.
    Throw(TaskError),
    /// Drive the return path: the procedure must run its cleanup arms and
    /// then return. Carries `Value::TaskCancel` on cancellation and
    /// `Value::End` when a take observed a closed channel.
    Finish(Value),
}

/// One step of a procedure.
pub enum ProgramStep {
    /// The procedure yielded something for the interpreter to perform.
    Yield(Yielded),
    /// The procedure completed with a value.
    Return(Value),
    /// The procedure failed.
    Throw(TaskError),
}

/// The inputs the interpreter accepts from a yield.
pub enum Yielded {
    /// An effect descriptor.
    Effect(Effect),
    /// An awaitable: the procedure resumes when it settles.
    Deferred(Deferred),
    /// A nested procedure, run to completion in the current task.
    Program(ProgramBox),
    /// Anything else is delivered straight back.
    Value(Value),
}

pub type ProgramBox = Box<dyn SagaProgram>;

/// A procedure the interpreter can drive.
///
/// Implementations are typically small state machines: a phase enum plus
/// whatever the procedure carries between suspension points. `resume` must
/// honor `ProgramInput::Finish` by running cleanup and returning; a
/// procedure without cleanup just returns the carried value.
pub trait SagaProgram: Send {
    fn resume(&mut self, input: ProgramInput) -> ProgramStep;

    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Closure-backed procedure, for small sagas written inline.
pub struct FnSaga<F> {
    name: String,
    step: F,
}

impl<F> FnSaga<F>
where
    F: FnMut(ProgramInput) -> ProgramStep + Send + 'static,
{
    pub fn new(name: impl Into<String>, step: F) -> Self {
        FnSaga {
            name: name.into(),
            step,
        }
    }

    pub fn boxed(name: impl Into<String>, step: F) -> ProgramBox {
        Box::new(FnSaga::new(name, step))
    }
}

impl<F> SagaProgram for FnSaga<F>
where
    F: FnMut(ProgramInput) -> ProgramStep + Send + 'static,
{
    fn resume(&mut self, input: ProgramInput) -> ProgramStep {
        (self.step)(input)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A procedure whose construction failed: rethrows on the first step.
///
/// Used when a fork factory errors synchronously, so the failure surfaces
/// through the child task instead of at the fork site.
pub(crate) struct FailedProgram {
    name: String,
    error: Option<TaskError>,
}

impl FailedProgram {
    pub fn new(name: impl Into<String>, error: TaskError) -> Self {
        FailedProgram {
            name: name.into(),
            error: Some(error),
        }
    }
}

impl SagaProgram for FailedProgram {
    fn resume(&mut self, input: ProgramInput) -> ProgramStep {
        match self.error.take() {
            Some(error) => ProgramStep::Throw(error),
            None => match input {
                ProgramInput::Finish(v) => ProgramStep::Return(v),
                _ => ProgramStep::Return(Value::Unit),
            },
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Yielded {
    /// Short single-line description for diagnostics and traces.
    pub fn describe(&self) -> String {
        match self {
            Yielded::Effect(e) => e.describe(),
            Yielded::Deferred(_) => "deferred".to_string(),
            Yielded::Program(p) => format!("program({})", p.name()),
            Yielded::Value(v) => v.describe(),
        }
    }
}

impl std::fmt::Debug for Yielded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Yielded({})", self.describe())
    }
}

impl std::fmt::Debug for ProgramStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgramStep::Yield(y) => write!(f, "Yield({})", y.describe()),
            ProgramStep::Return(v) => write!(f, "Return({})", v.describe()),
            ProgramStep::Throw(e) => write!(f, "Throw({})", e.message),
        }
    }
}

impl From<Effect> for Yielded {
    fn from(e: Effect) -> Self {
        Yielded::Effect(e)
    }
}

impl From<Deferred> for Yielded {
    fn from(d: Deferred) -> Self {
        Yielded::Deferred(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_saga_steps() {
        let mut saga = FnSaga::new("counter", |input| match input {
            ProgramInput::Next(Value::Unit) => ProgramStep::Yield(Yielded::Value(Value::Int(1))),
            ProgramInput::Next(v) => ProgramStep::Return(v),
            ProgramInput::Throw(e) => ProgramStep::Throw(e),
            ProgramInput::Finish(v) => ProgramStep::Return(v),
        });
        assert_eq!(saga.name(), "counter");
        assert!(matches!(
            saga.resume(ProgramInput::Next(Value::Unit)),
            ProgramStep::Yield(Yielded::Value(Value::Int(1)))
        ));
        assert!(matches!(
            saga.resume(ProgramInput::Next(Value::Int(1))),
            ProgramStep::Return(Value::Int(1))
        ));
    }

    #[test]
    fn test_failed_program_throws_once() {
        let mut p = FailedProgram::new("broken", TaskError::new("ctor failed"));
        assert!(matches!(
            p.resume(ProgramInput::Next(Value::Unit)),
            ProgramStep::Throw(e) if e.message == "ctor failed"
        ));
        assert!(matches!(
            p.resume(ProgramInput::Finish(Value::TaskCancel)),
            ProgramStep::Return(Value::TaskCancel)
        ));
    }
}
