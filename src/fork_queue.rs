//! The per-procedure fork queue.
//!
//! Tracks the main task and every attached fork. The procedure is complete
//! when every member has terminated; it aborts the moment one member fails,
//! cancelling the rest and reporting the error upward once.

use std::sync::{Arc, Mutex};

use crate::error::TaskError;
use crate::task::{MainTask, Task};
use crate::value::Value;

/// Continuation reporting the whole procedure's outcome upward.
pub(crate) type QueueCont = Box<dyn FnOnce(Result<Value, TaskError>) + Send>;

#[derive(Clone)]
pub(crate) enum QueueMember {
    Main(MainTask),
    Child(Task),
}

impl QueueMember {
    fn name(&self) -> String {
        match self {
            QueueMember::Main(m) => m.name().to_string(),
            QueueMember::Child(t) => t.name().to_string(),
        }
    }

    fn cancel(&self) {
        match self {
            QueueMember::Main(m) => m.cancel(),
            QueueMember::Child(t) => t.cancel(),
        }
    }

    fn clear_cont(&self) {
        match self {
            QueueMember::Main(m) => m.clear_cont(),
            QueueMember::Child(t) => t.clear_cont(),
        }
    }

    fn set_cont(&self, cont: Box<dyn FnOnce(Result<Value, TaskError>) + Send>) {
        match self {
            QueueMember::Main(m) => m.set_cont(cont),
            QueueMember::Child(t) => t.set_cont(cont),
        }
    }
}

struct QueueState {
    members: Vec<(u64, QueueMember)>,
    next_key: u64,
    /// Captured from the main task; becomes the procedure's overall result.
    result: Option<Value>,
    completed: bool,
    cont: Option<QueueCont>,
}

enum After {
    Nothing,
    Abort {
        err: TaskError,
        to_cancel: Vec<QueueMember>,
    },
    Complete {
        result: Value,
    },
}

#[derive(Clone)]
pub(crate) struct ForkQueue {
    state: Arc<Mutex<QueueState>>,
}

impl ForkQueue {
    pub fn new(main: MainTask, cont: QueueCont) -> Self {
        let queue = ForkQueue {
            state: Arc::new(Mutex::new(QueueState {
                members: Vec::new(),
                next_key: 0,
                result: None,
                completed: false,
                cont: Some(cont),
            })),
        };
        queue.attach(QueueMember::Main(main), true);
        queue
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().expect("fork queue lock poisoned")
    }

    pub fn add_task(&self, task: Task) {
        self.attach(QueueMember::Child(task), false);
    }

    fn attach(&self, member: QueueMember, is_main: bool) {
        let key = {
            let mut state = self.lock();
            let key = state.next_key;
            state.next_key += 1;
            state.members.push((key, member.clone()));
            key
        };
        let queue = self.clone();
        member.set_cont(Box::new(move |outcome| {
            queue.member_done(key, is_main, outcome);
        }));
    }

    fn member_done(&self, key: u64, is_main: bool, outcome: Result<Value, TaskError>) {
        let after = {
            let mut state = self.lock();
            if state.completed {
                return;
            }
            if let Some(pos) = state.members.iter().position(|(k, _)| *k == key) {
                state.members.remove(pos);
            }
            match outcome {
                Err(mut err) => {
                    state.completed = true;
                    let names: Vec<String> =
                        state.members.iter().map(|(_, m)| m.name()).collect();
                    if !names.is_empty() {
                        err.push_frame(format!(
                            "tasks cancelled due to sibling error: {}",
                            names.join(", ")
                        ));
                    }
                    let to_cancel = state.members.drain(..).map(|(_, m)| m).collect();
                    After::Abort { err, to_cancel }
                }
                Ok(v) => {
                    if is_main {
                        state.result = Some(v);
                    }
                    if state.members.is_empty() {
                        state.completed = true;
                        After::Complete {
                            result: state.result.take().unwrap_or(Value::Unit),
                        }
                    } else {
                        After::Nothing
                    }
                }
            }
        };
        self.finish(after);
    }

    /// Abort the whole procedure with `err`: cancels every member and
    /// reports the error upward. Used when a freshly forked child has
    /// already failed before it could be attached.
    pub fn abort(&self, err: TaskError) {
        let after = {
            let mut state = self.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            let mut err = err;
            let names: Vec<String> = state.members.iter().map(|(_, m)| m.name()).collect();
            if !names.is_empty() {
                err.push_frame(format!(
                    "tasks cancelled due to sibling error: {}",
                    names.join(", ")
                ));
            }
            let to_cancel = state.members.drain(..).map(|(_, m)| m).collect();
            After::Abort { err, to_cancel }
        };
        self.finish(after);
    }

    /// Cancel every member without reporting upward. The completed flag
    /// guards against re-entry from the cancellations themselves.
    pub fn cancel_all(&self) {
        let members: Vec<QueueMember> = {
            let mut state = self.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            state.members.drain(..).map(|(_, m)| m).collect()
        };
        for member in members {
            member.clear_cont();
            member.cancel();
        }
    }

    fn finish(&self, after: After) {
        match after {
            After::Nothing => {}
            After::Abort { err, to_cancel } => {
                for member in to_cancel {
                    member.clear_cont();
                    member.cancel();
                }
                let cont = self.lock().cont.take();
                if let Some(cont) = cont {
                    cont(Err(err));
                }
            }
            After::Complete { result } => {
                let cont = self.lock().cont.take();
                if let Some(cont) = cont {
                    cont(Ok(result));
                }
            }
        }
    }

    #[cfg(test)]
    fn member_count(&self) -> usize {
        self.lock().members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;

    fn queue_with_recorder(
        main: &MainTask,
    ) -> (ForkQueue, Arc<Mutex<Vec<Result<Value, TaskError>>>>) {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let queue = ForkQueue::new(
            main.clone(),
            Box::new({
                let reported = reported.clone();
                move |outcome| reported.lock().unwrap().push(outcome)
            }),
        );
        (queue, reported)
    }

    #[test]
    fn test_completes_when_all_members_terminate() {
        let main = MainTask::new("main");
        let (queue, reported) = queue_with_recorder(&main);
        let child = Task::new("child", false, TaskContext::new());
        queue.add_task(child.clone());

        main.complete(Ok(Value::Int(42)));
        assert!(reported.lock().unwrap().is_empty());

        child.end(Ok(Value::Unit));
        assert_eq!(*reported.lock().unwrap(), vec![Ok(Value::Int(42))]);
    }

    #[test]
    fn test_member_error_cancels_siblings_and_reports_once() {
        let main = MainTask::new("main");
        let (queue, reported) = queue_with_recorder(&main);
        let worker = Task::new("worker", false, TaskContext::new());
        let failing = Task::new("failing", false, TaskContext::new());
        queue.add_task(worker.clone());
        queue.add_task(failing.clone());

        failing.end(Err(TaskError::new("boom")));

        assert!(worker.is_cancelled());
        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        let err = reported[0].clone().unwrap_err();
        assert_eq!(err.message, "boom");
        let stack = err.stack().join("\n");
        assert!(stack.contains("main"));
        assert!(stack.contains("worker"));
    }

    #[test]
    fn test_cancel_all_is_guarded_against_reentry() {
        let main = MainTask::new("main");
        let (queue, reported) = queue_with_recorder(&main);
        let child = Task::new("child", false, TaskContext::new());
        queue.add_task(child.clone());

        queue.cancel_all();
        assert!(child.is_cancelled());
        assert_eq!(queue.member_count(), 0);
        // no upward report on plain cancellation
        assert!(reported.lock().unwrap().is_empty());
        queue.cancel_all();
    }

    #[test]
    fn test_conservation_every_member_accounted_for() {
        let main = MainTask::new("main");
        let (queue, reported) = queue_with_recorder(&main);
        let mut children = Vec::new();
        for i in 0..5 {
            let t = Task::new(format!("c{}", i), false, TaskContext::new());
            queue.add_task(t.clone());
            children.push(t);
        }
        main.complete(Ok(Value::Unit));
        for (i, child) in children.iter().enumerate() {
            assert!(reported.lock().unwrap().is_empty());
            child.end(Ok(Value::Int(i as i64)));
        }
        // 6 ever added, all terminated, exactly one report after the last
        assert_eq!(reported.lock().unwrap().len(), 1);
        assert_eq!(queue.member_count(), 0);
    }
}
