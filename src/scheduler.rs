//! Counting-semaphore micro-scheduler.
//!
//! Serializes enqueued work so that no scheduled task executes while any
//! other is mid-flight: while `exec` is on the stack the semaphore is held,
//! and nested `asap` calls only enqueue. This makes the interpretation of a
//! single effect atomic with respect to the nested effects it triggers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send>;

struct SchedulerState {
    semaphore: u32,
    queue: VecDeque<Job>,
}

/// Shared handle to one scheduling domain.
///
/// Each runtime environment owns one scheduler; every put and fork in that
/// runtime is ordered through it.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
}

/// Releases the semaphore when dropped, so an unwinding job cannot leave the
/// scheduler locked.
struct ReleaseGuard<'a>(&'a Scheduler);

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Flushes (and thereby releases) when dropped; pairs with a `suspend` to
/// bracket an atomic region.
struct FlushGuard<'a>(&'a Scheduler);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.flush();
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            state: Arc::new(Mutex::new(SchedulerState {
                semaphore: 0,
                queue: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().expect("scheduler lock poisoned")
    }

    /// Acquire one unit of the semaphore, deferring subsequent work.
    pub fn suspend(&self) {
        self.lock().semaphore += 1;
    }

    /// Release one unit of the semaphore.
    pub fn release(&self) {
        let mut state = self.lock();
        debug_assert!(state.semaphore > 0, "scheduler released below zero");
        state.semaphore -= 1;
    }

    /// Enqueue `job`; run the queue now unless something is mid-flight.
    pub fn asap(&self, job: Job) {
        let run_now = {
            let mut state = self.lock();
            state.queue.push_back(job);
            if state.semaphore == 0 {
                state.semaphore += 1;
                true
            } else {
                false
            }
        };
        if run_now {
            self.flush();
        }
    }

    /// Run `f` with the semaphore held, then drain the queue.
    ///
    /// Used to make a fork atomic: anything the child enqueues during its
    /// first slice runs only after the fork itself has returned.
    pub fn immediately<T>(&self, f: impl FnOnce() -> T) -> T {
        self.suspend();
        let flush = FlushGuard(self);
        let result = f();
        drop(flush);
        result
    }

    /// Release one unit, then drain the queue while it is uncontended.
    pub fn flush(&self) {
        self.release();
        loop {
            let job = {
                let mut state = self.lock();
                if state.semaphore == 0 {
                    state.queue.pop_front()
                } else {
                    None
                }
            };
            let Some(job) = job else { break };
            self.exec(job);
        }
    }

    fn exec(&self, job: Job) {
        self.suspend();
        let _release = ReleaseGuard(self);
        job();
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.lock().queue.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Scheduler")
            .field("semaphore", &state.semaphore)
            .field("queued", &state.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn shared_log() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let push = {
            let log = log.clone();
            move |entry| log.lock().unwrap().push(entry)
        };
        (log, push)
    }

    #[test]
    fn test_asap_runs_immediately_when_idle() {
        let (log, push) = shared_log();
        let sched = Scheduler::new();
        sched.asap(Box::new({
            let push = push.clone();
            move || push("a")
        }));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_nested_asap_is_deferred() {
        let (log, push) = shared_log();
        let sched = Scheduler::new();
        sched.asap(Box::new({
            let sched = sched.clone();
            let push = push.clone();
            move || {
                push("outer-start");
                sched.asap(Box::new({
                    let push = push.clone();
                    move || push("inner")
                }));
                push("outer-end");
            }
        }));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer-start", "outer-end", "inner"]
        );
    }

    #[test]
    fn test_immediately_defers_enqueued_work_until_after() {
        let (log, push) = shared_log();
        let sched = Scheduler::new();
        let result = sched.immediately(|| {
            push("forked");
            sched.asap(Box::new({
                let push = push.clone();
                move || push("queued")
            }));
            push("fork-done");
            42
        });
        assert_eq!(result, 42);
        assert_eq!(*log.lock().unwrap(), vec!["forked", "fork-done", "queued"]);
    }

    #[test]
    fn test_suspend_blocks_asap_until_flush() {
        let (log, push) = shared_log();
        let sched = Scheduler::new();
        sched.suspend();
        sched.asap(Box::new({
            let push = push.clone();
            move || push("a")
        }));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(sched.pending(), 1);
        sched.suspend();
        sched.flush();
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    proptest! {
        // No enqueued job ever begins while another is on the stack: every
        // job observes depth 0 on entry, regardless of nesting structure.
        #[test]
        fn prop_no_job_starts_while_another_runs(fanouts in proptest::collection::vec(0usize..4, 1..20)) {
            let sched = Scheduler::new();
            let depth = Arc::new(Mutex::new(0u32));
            let violations = Arc::new(Mutex::new(0u32));
            let executed = Arc::new(Mutex::new(0usize));

            fn spawn_job(
                sched: &Scheduler,
                fanouts: Arc<Vec<usize>>,
                idx: usize,
                depth: Arc<Mutex<u32>>,
                violations: Arc<Mutex<u32>>,
                executed: Arc<Mutex<usize>>,
            ) {
                let sched2 = sched.clone();
                sched.asap(Box::new(move || {
                    {
                        let mut d = depth.lock().unwrap();
                        if *d != 0 {
                            *violations.lock().unwrap() += 1;
                        }
                        *d += 1;
                    }
                    *executed.lock().unwrap() += 1;
                    let children = fanouts.get(idx).copied().unwrap_or(0);
                    for child in 0..children {
                        let next = idx * 4 + child + 1;
                        if next < fanouts.len() {
                            spawn_job(
                                &sched2,
                                fanouts.clone(),
                                next,
                                depth.clone(),
                                violations.clone(),
                                executed.clone(),
                            );
                        }
                    }
                    *depth.lock().unwrap() -= 1;
                }));
            }

            let fanouts = Arc::new(fanouts);
            spawn_job(&sched, fanouts, 0, depth, violations.clone(), executed.clone());
            prop_assert_eq!(*violations.lock().unwrap(), 0);
            prop_assert!(*executed.lock().unwrap() >= 1);
        }
    }
}
