//! Entry points: standalone runner and the host middleware adapter.

use std::sync::{Arc, Mutex};

use crate::error::{RuntimeError, TaskError};
use crate::ids::EffectId;
use crate::monitor::SagaMonitor;
use crate::multicast::{MulticastChannel, StdChannel};
use crate::proc::proc;
use crate::program::{ProgramBox, Yielded};
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskContext};
use crate::value::{Action, Value};

/// Severity passed to the logger callback.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LogLevel {
    Info,
    Error,
}

pub type DispatchFn = Arc<dyn Fn(Action) -> Value + Send + Sync>;
pub type GetStateFn = Arc<dyn Fn() -> Value + Send + Sync>;
pub type LoggerFn = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;
pub type OnErrorFn = Arc<dyn Fn(&TaskError) + Send + Sync>;

/// User-installed wrapper around the interpreter's effect execution.
///
/// Receives the yielded item and the continuation of the chain; it must
/// either forward (possibly transformed) or complete the effect through
/// other means — swallowing the item without forwarding is a programmer
/// error the runtime cannot detect.
pub type EffectMiddleware = Arc<dyn Fn(Yielded, Box<dyn FnOnce(Yielded) + Send>) + Send + Sync>;

/// The emit half of the std channel, as seen by an emitter adapter.
pub type EmitFn = Arc<dyn Fn(Action) + Send + Sync>;

/// User adapter wrapped around the middleware's channel emit.
pub type EmitterWrapper = Arc<dyn Fn(EmitFn) -> EmitFn + Send + Sync>;

/// The per-runtime environment shared by every procedure.
pub(crate) struct SagaEnv {
    pub std_channel: StdChannel,
    pub scheduler: Scheduler,
    pub dispatch: DispatchFn,
    pub get_state: GetStateFn,
    pub monitor: Option<Arc<dyn SagaMonitor>>,
    pub on_error: OnErrorFn,
    pub middlewares: Vec<EffectMiddleware>,
}

/// Options accepted by `run_saga` and `SagaMiddleware`.
#[derive(Clone)]
pub struct RunSagaOptions {
    channel: Option<MulticastChannel>,
    dispatch: Option<DispatchFn>,
    get_state: Option<GetStateFn>,
    context: Vec<(String, Value)>,
    monitor: Option<Arc<dyn SagaMonitor>>,
    logger: Option<LoggerFn>,
    on_error: Option<OnErrorFn>,
    effect_middlewares: Vec<EffectMiddleware>,
    emitter: Option<EmitterWrapper>,
}

impl RunSagaOptions {
    pub fn new() -> Self {
        RunSagaOptions {
            channel: None,
            dispatch: None,
            get_state: None,
            context: Vec::new(),
            monitor: None,
            logger: None,
            on_error: None,
            effect_middlewares: Vec::new(),
            emitter: None,
        }
    }

    /// Use an existing multicast channel as the std channel's basis.
    pub fn with_channel(mut self, channel: MulticastChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_dispatch(mut self, f: impl Fn(Action) -> Value + Send + Sync + 'static) -> Self {
        self.dispatch = Some(Arc::new(f));
        self
    }

    pub fn with_get_state(mut self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.get_state = Some(Arc::new(f));
        self
    }

    /// Seed the root task context.
    pub fn with_context_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.push((key.into(), value));
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn SagaMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_logger(mut self, f: impl Fn(LogLevel, &str) + Send + Sync + 'static) -> Self {
        self.logger = Some(Arc::new(f));
        self
    }

    /// Sink for errors no procedure caught.
    pub fn with_on_error(mut self, f: impl Fn(&TaskError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn with_effect_middleware(
        mut self,
        f: impl Fn(Yielded, Box<dyn FnOnce(Yielded) + Send>) + Send + Sync + 'static,
    ) -> Self {
        self.effect_middlewares.push(Arc::new(f));
        self
    }

    /// Adapter wrapped around the middleware's channel emit.
    pub fn with_emitter(mut self, f: impl Fn(EmitFn) -> EmitFn + Send + Sync + 'static) -> Self {
        self.emitter = Some(Arc::new(f));
        self
    }
}

impl Default for RunSagaOptions {
    fn default() -> Self {
        RunSagaOptions::new()
    }
}

fn default_logger() -> LoggerFn {
    Arc::new(|level, message| match level {
        LogLevel::Error => eprintln!("saga-rt error: {}", message),
        LogLevel::Info => eprintln!("saga-rt: {}", message),
    })
}

fn build_env(
    options: &RunSagaOptions,
    channel: MulticastChannel,
    scheduler: Scheduler,
    dispatch: Option<DispatchFn>,
    get_state: Option<GetStateFn>,
) -> Arc<SagaEnv> {
    let std_channel = StdChannel::new(channel, scheduler.clone());
    let dispatch = dispatch.or_else(|| options.dispatch.clone()).unwrap_or_else(|| {
        // No host store: dispatching an action is putting it into the std
        // channel; the dispatch result is the action itself.
        let std_channel = std_channel.clone();
        Arc::new(move |action: Action| {
            std_channel.put(action.clone());
            Value::Action(action)
        })
    });
    let get_state = get_state
        .or_else(|| options.get_state.clone())
        .unwrap_or_else(|| Arc::new(|| Value::None));
    let logger = options.logger.clone().unwrap_or_else(default_logger);
    let on_error = options.on_error.clone().unwrap_or_else(|| {
        Arc::new(move |err: &TaskError| {
            logger(LogLevel::Error, &format!("uncaught error: {}", err));
        })
    });
    Arc::new(SagaEnv {
        std_channel,
        scheduler,
        dispatch,
        get_state,
        monitor: options.monitor.clone(),
        on_error,
        middlewares: options.effect_middlewares.clone(),
    })
}

fn start_root(env: &Arc<SagaEnv>, context: TaskContext, program: ProgramBox) -> Task {
    let effect_id = EffectId::fresh();
    let name = program.name().to_string();
    if let Some(m) = &env.monitor {
        m.root_saga_started(effect_id, &name);
    }
    env.scheduler.immediately(|| {
        proc(env.clone(), program, context, effect_id, name, true, None)
    })
}

/// Run a procedure as a root task against a fresh (or provided) channel.
pub fn run_saga(options: RunSagaOptions, program: ProgramBox) -> Task {
    let scheduler = Scheduler::new();
    let channel = options.channel.clone().unwrap_or_default();
    let env = build_env(&options, channel, scheduler, None, None);
    let context = TaskContext::new();
    context.extend(options.context.clone());
    start_root(&env, context, program)
}

// ---------------------------------------------------------------------------
// Host middleware adapter
// ---------------------------------------------------------------------------

/// Adapter between a store-like host (`dispatch` + `getState`) and the
/// runtime: wraps the host's dispatch chain so every action is forwarded
/// first and then put into the std channel, and exposes `run`/`set_context`.
pub struct SagaMiddleware {
    options: RunSagaOptions,
    channel: MulticastChannel,
    scheduler: Scheduler,
    root_context: TaskContext,
    env: Mutex<Option<Arc<SagaEnv>>>,
}

impl SagaMiddleware {
    pub fn new(options: RunSagaOptions) -> Self {
        let channel = options.channel.clone().unwrap_or_default();
        let root_context = TaskContext::new();
        root_context.extend(options.context.clone());
        SagaMiddleware {
            options,
            channel,
            scheduler: Scheduler::new(),
            root_context,
            env: Mutex::new(None),
        }
    }

    /// Bind the host store. Must happen before `run`.
    pub fn connect(
        &self,
        dispatch: impl Fn(Action) -> Value + Send + Sync + 'static,
        get_state: impl Fn() -> Value + Send + Sync + 'static,
    ) {
        let env = build_env(
            &self.options,
            self.channel.clone(),
            self.scheduler.clone(),
            Some(Arc::new(dispatch)),
            Some(Arc::new(get_state)),
        );
        *self.env.lock().expect("middleware env lock poisoned") = Some(env);
    }

    /// Wrap one link of the host's dispatch chain: report to the monitor,
    /// forward to `next` first (so the host state observes the action
    /// before procedures react), then put the action into the std channel.
    pub fn wrap_dispatch(&self, next: DispatchFn) -> DispatchFn {
        let std_channel = StdChannel::new(self.channel.clone(), self.scheduler.clone());
        let emit: EmitFn = Arc::new({
            let std_channel = std_channel.clone();
            move |action: Action| std_channel.put(action)
        });
        let emit = match &self.options.emitter {
            Some(wrapper) => wrapper(emit),
            None => emit,
        };
        let monitor = self.options.monitor.clone();
        Arc::new(move |action: Action| {
            if let Some(m) = &monitor {
                m.action_dispatched(&action);
            }
            let result = next(action.clone());
            emit(action);
            result
        })
    }

    /// Start a procedure as a root task in this middleware's environment.
    pub fn run(&self, program: ProgramBox) -> Result<Task, RuntimeError> {
        let env = self
            .env
            .lock()
            .expect("middleware env lock poisoned")
            .clone()
            .ok_or(RuntimeError::NotConnected)?;
        Ok(start_root(&env, self.root_context.clone(), program))
    }

    /// Merge entries into the context every subsequently run root inherits.
    pub fn set_context(&self, entries: impl IntoIterator<Item = (String, Value)>) {
        self.root_context.extend(entries);
    }

    /// The std channel's multicast basis, e.g. for external takers.
    pub fn channel(&self) -> &MulticastChannel {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{FnSaga, ProgramInput, ProgramStep};

    #[test]
    fn test_run_saga_completes_simple_program() {
        let task = run_saga(
            RunSagaOptions::new(),
            FnSaga::boxed("simple", |input| match input {
                ProgramInput::Next(Value::Unit) => ProgramStep::Return(Value::Int(42)),
                ProgramInput::Finish(v) => ProgramStep::Return(v),
                _ => ProgramStep::Return(Value::Unit),
            }),
        );
        assert!(!task.is_running());
        assert_eq!(task.result(), Some(Value::Int(42)));
    }

    #[test]
    fn test_middleware_requires_connect() {
        let mw = SagaMiddleware::new(RunSagaOptions::new());
        let result = mw.run(FnSaga::boxed("never", |_| ProgramStep::Return(Value::Unit)));
        assert!(result.is_err());
    }

    #[test]
    fn test_wrap_dispatch_forwards_then_emits() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mw = SagaMiddleware::new(RunSagaOptions::new());
        let wrapped = mw.wrap_dispatch(Arc::new({
            let order = order.clone();
            move |action: Action| {
                order.lock().unwrap().push("reducer");
                Value::Action(action)
            }
        }));
        // an external taker on the middleware channel observes the action
        // after the reducer ran
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb = crate::callback::EffectCallback::new(Arc::new({
            let order = order.clone();
            let seen = seen.clone();
            move |res| {
                order.lock().unwrap().push("taker");
                if let Ok(v) = res {
                    seen.lock().unwrap().push(v);
                }
            }
        }));
        mw.channel()
            .take(cb, crate::matcher::Matcher::wildcard());

        let result = wrapped(Action::new("PING"));
        assert_eq!(*order.lock().unwrap(), vec!["reducer", "taker"]);
        assert_eq!(result, Value::Action(Action::new("PING")));
    }
}
