//! saga-rt: a cooperative effect-driven task runtime.
//!
//! User procedures are explicit continuation records ("programs") that yield
//! *effect descriptors* — declarative requests such as take, put, call, fork,
//! race, all, cancel, join. The runtime interprets each descriptor: it
//! suspends the program, performs the effect, resumes the program with a
//! value or an error, and manages the resulting forest of concurrently
//! executing child procedures.
//!
//! # Architecture
//!
//! - **Atomic scheduler**: counting-semaphore micro-queue; nested work only
//!   enqueues while any scheduled task is mid-flight
//! - **Channels**: single-consumer buffered rendezvous plus a pattern-matching
//!   multicast channel with copy-on-write taker snapshots
//! - **Task/fork tree**: parent/child task graph with abort and cancellation
//!   propagation
//! - **Effect interpreter**: continuation-style driver with exactly-once
//!   completion callbacks and cascading cancel hooks

pub mod buffer;
mod callback;
pub mod channel;
pub mod deferred;
pub mod effect;
pub mod error;
mod fork_queue;
pub mod helpers;
pub mod ids;
pub mod logging;
pub mod matcher;
pub mod monitor;
pub mod multicast;
mod proc;
pub mod program;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod value;

pub use buffer::Buffer;
pub use channel::{event_channel, Channel, ChannelRef, Emitter, EventChannel};
pub use deferred::Deferred;
pub use effect::{
    action_channel, all, all_named, call, cancel, cancel_self, cancel_tasks, cancelled, cps, flush,
    fork, get_context, join, join_all, put, put_resolve, put_to, race, race_named, select,
    set_context, spawn, take, take_from, take_maybe, CallOutcome, CancelTarget, ComboShape,
    CpsCallback, Effect,
};
pub use error::{RuntimeError, TaskError};
pub use helpers::{take_every, take_latest, take_leading};
pub use ids::{ChannelId, EffectId, TakerId, TaskId};
pub use matcher::{Matcher, Pattern};
pub use monitor::{EffectInfo, SagaMonitor, TraceEntry, TraceMonitor};
pub use multicast::{MulticastChannel, StdChannel};
pub use program::{FnSaga, ProgramBox, ProgramInput, ProgramStep, SagaProgram, Yielded};
pub use runner::{
    run_saga, DispatchFn, EffectMiddleware, EmitFn, EmitterWrapper, GetStateFn, LogLevel,
    LoggerFn, OnErrorFn, RunSagaOptions, SagaMiddleware,
};
pub use scheduler::Scheduler;
pub use task::{Task, TaskContext, TaskStatus};
pub use value::{Action, Value, END_KIND};
