//! Error types for the runtime.
//!
//! Two planes: `RuntimeError` is a library-level misuse error that fails at
//! the call site; `TaskError` is the error value that flows through a
//! procedure the way a thrown exception would, carrying the synthesized
//! trace of nested procedures assembled as an abort unwinds the fork tree.

/// Library-level errors: misuse detected at a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A fixed-capacity buffer rejected a put.
    BufferOverflow { capacity: usize },
    /// An operation the target channel kind does not support.
    UnsupportedOperation { operation: &'static str },
    /// A put effect with no target channel carried a non-action value.
    InvalidDispatch { describe: String },
    /// The middleware adapter was asked to run before a store was bound.
    NotConnected,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::BufferOverflow { capacity } => {
                write!(f, "channel buffer overflow: capacity {} exceeded", capacity)
            }
            RuntimeError::UnsupportedOperation { operation } => {
                write!(f, "operation not supported by this channel: {}", operation)
            }
            RuntimeError::InvalidDispatch { describe } => {
                write!(f, "put without a channel requires an action, got {}", describe)
            }
            RuntimeError::NotConnected => {
                write!(f, "middleware must be connected to a store before running")
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    pub fn buffer_overflow(capacity: usize) -> Self {
        RuntimeError::BufferOverflow { capacity }
    }

    pub fn unsupported(operation: &'static str) -> Self {
        RuntimeError::UnsupportedOperation { operation }
    }

    pub fn invalid_dispatch(describe: impl Into<String>) -> Self {
        RuntimeError::InvalidDispatch {
            describe: describe.into(),
        }
    }
}

/// The error value a procedure aborts with.
///
/// `saga_stack` grows as the error unwinds the fork tree: each procedure
/// appends its own frame (its name, the effect it was running when it
/// failed, and the siblings cancelled because of it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub message: String,
    pub saga_stack: Vec<String>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        TaskError {
            message: message.into(),
            saga_stack: Vec::new(),
        }
    }

    pub(crate) fn push_frame(&mut self, frame: String) {
        self.saga_stack.push(frame);
    }

    /// The synthesized trace, innermost frame first.
    pub fn stack(&self) -> &[String] {
        &self.saga_stack
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.saga_stack {
            write!(f, "\n    {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

impl From<RuntimeError> for TaskError {
    fn from(err: RuntimeError) -> Self {
        TaskError::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError::buffer_overflow(4);
        assert!(err.to_string().contains("capacity 4"));

        let err = RuntimeError::unsupported("flush");
        assert!(err.to_string().contains("flush"));
    }

    #[test]
    fn test_task_error_stack_accumulates() {
        let mut err = TaskError::new("boom");
        err.push_frame("in task worker".to_string());
        err.push_frame("in task root".to_string());
        assert_eq!(err.stack().len(), 2);
        assert!(err.to_string().contains("boom"));
        assert!(err.to_string().contains("in task worker"));
    }

    #[test]
    fn test_runtime_error_converts_to_task_error() {
        let err: TaskError = RuntimeError::buffer_overflow(2).into();
        assert!(err.message.contains("overflow"));
        assert!(err.stack().is_empty());
    }
}
