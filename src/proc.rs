//! The effect interpreter.
//!
//! `proc` drives one procedure: it advances the program, digests each
//! yielded item through an exactly-once completion wrapper, routes it to
//! the matching runner, and wires cancellation so that a pending effect can
//! always be detached. Forked children land in the fork queue; the queue
//! reports the procedure's overall outcome to the task handle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::callback::{CancelFn, EffectCallback, EffectResult};
use crate::channel::{Channel, ChannelRef};
use crate::deferred::Deferred;
use crate::effect::{
    CallFn, CallOutcome, CancelTarget, ComboShape, CpsCallback, CpsFn, Effect, ForkFn, SelectFn,
};
use crate::error::TaskError;
use crate::fork_queue::ForkQueue;
use crate::ids::EffectId;
use crate::matcher::{Matcher, Pattern};
use crate::monitor::EffectInfo;
use crate::program::{FailedProgram, ProgramBox, ProgramInput, ProgramStep, Yielded};
use crate::rt_debug_log;
use crate::runner::SagaEnv;
use crate::task::{MainTask, Task, TaskContext};
use crate::value::Value;

pub(crate) struct ProcCore {
    env: Arc<SagaEnv>,
    name: String,
    program: Mutex<ProgramBox>,
    task: Task,
    main: MainTask,
    queue: ForkQueue,
    parent_effect_id: EffectId,
    /// The cancel hook installed by the currently pending effect.
    next_cancel: Arc<Mutex<Option<CancelFn>>>,
    /// Description of the last effect that failed, for the saga stack.
    crashed_effect: Arc<Mutex<Option<String>>>,
}

/// Start interpreting `program` and return its task handle.
///
/// `cont`, when present, receives the procedure's terminal outcome and has
/// cancellation of the child installed as its cancel hook (this is how a
/// yielded nested program chains into its parent).
pub(crate) fn proc(
    env: Arc<SagaEnv>,
    program: ProgramBox,
    parent_context: TaskContext,
    parent_effect_id: EffectId,
    name: String,
    is_root: bool,
    cont: Option<EffectCallback>,
) -> Task {
    let context = parent_context.child();
    let main = MainTask::new(name.clone());
    let task = Task::new(name.clone(), is_root, context);
    let crashed_effect: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let queue = ForkQueue::new(
        main.clone(),
        Box::new({
            let task = task.clone();
            let env = env.clone();
            let name = name.clone();
            let crashed = crashed_effect.clone();
            move |mut outcome| {
                if let Err(e) = &mut outcome {
                    let mut frame = format!("in task {}", name);
                    if let Some(effect) =
                        crashed.lock().expect("crashed effect lock poisoned").take()
                    {
                        frame.push_str(&format!(" while running {}", effect));
                    }
                    e.push_frame(frame);
                    if task.is_root() {
                        (env.on_error)(e);
                    }
                }
                task.end(outcome);
            }
        }),
    );
    task.set_cancel_hook(Box::new({
        let queue = queue.clone();
        move || queue.cancel_all()
    }));

    let core = Arc::new(ProcCore {
        env,
        name,
        program: Mutex::new(program),
        task: task.clone(),
        main: main.clone(),
        queue,
        parent_effect_id,
        next_cancel: Arc::new(Mutex::new(None)),
        crashed_effect,
    });

    main.set_cancel_hook(Box::new({
        let weak = Arc::downgrade(&core);
        move || {
            if let Some(core) = weak.upgrade() {
                advance(&core, Ok(Value::TaskCancel));
            }
        }
    }));

    if let Some(cb) = cont {
        cb.set_cancel(Box::new({
            let task = task.clone();
            move || task.cancel()
        }));
        task.set_cont(Box::new(move |outcome| cb.deliver(outcome)));
    }

    advance(&core, Ok(Value::Unit));
    task
}

/// The driver: resume the program with a completed effect's outcome and
/// handle whatever it does next.
fn advance(core: &Arc<ProcCore>, input: EffectResult) {
    if core.main.is_terminated() {
        panic!(
            "task {} already completed: effect delivered twice",
            core.name
        );
    }
    let input = match input {
        Ok(Value::TaskCancel) => {
            core.main.set_cancelled();
            let pending = core
                .next_cancel
                .lock()
                .expect("pending cancel slot poisoned")
                .take();
            if let Some(pending) = pending {
                pending();
            }
            ProgramInput::Finish(Value::TaskCancel)
        }
        Ok(Value::End) => ProgramInput::Finish(Value::End),
        Ok(v) => ProgramInput::Next(v),
        Err(e) => ProgramInput::Throw(e),
    };
    let step = {
        let mut program = core.program.lock().expect("program lock poisoned");
        program.resume(input)
    };
    rt_debug_log!("[{}] step -> {:?}", core.name, step);
    match step {
        ProgramStep::Yield(item) => {
            let cb = next_callback(core);
            digest(core, item, core.parent_effect_id, cb, "");
        }
        ProgramStep::Return(v) => core.main.complete(Ok(v)),
        ProgramStep::Throw(e) => core.main.complete(Err(e)),
    }
}

/// The driver's callback: delivery resumes the program, and the cancel
/// slot is the one the currently pending effect installs into.
fn next_callback(core: &Arc<ProcCore>) -> EffectCallback {
    let core = core.clone();
    let slot = core.next_cancel.clone();
    EffectCallback::with_slot(Arc::new(move |res| advance(&core, res)), slot)
}

/// Wrap `cb` so the effect completes exactly once (a late cancel after
/// resolution, or a late resolve after cancel, is a no-op), then route to
/// the runner.
fn digest(core: &Arc<ProcCore>, input: Yielded, parent_id: EffectId, cb: EffectCallback, label: &str) {
    let effect_id = EffectId::fresh();
    if let Some(m) = &core.env.monitor {
        m.effect_triggered(&EffectInfo {
            effect_id,
            parent_effect_id: parent_id,
            label: label.to_string(),
            description: input.describe(),
        });
    }
    let settled = Arc::new(AtomicBool::new(false));
    let curr_slot: Arc<Mutex<Option<CancelFn>>> = Arc::new(Mutex::new(None));
    let curr_cb = EffectCallback::with_slot(
        Arc::new({
            let settled = settled.clone();
            let cb = cb.clone();
            let core = core.clone();
            let desc = input.describe();
            move |res: EffectResult| {
                if settled.swap(true, Ordering::SeqCst) {
                    return;
                }
                cb.clear_cancel();
                match &res {
                    Ok(v) => {
                        if let Some(m) = &core.env.monitor {
                            m.effect_resolved(effect_id, v);
                        }
                    }
                    Err(e) => {
                        if let Some(m) = &core.env.monitor {
                            m.effect_rejected(effect_id, e);
                        }
                        *core
                            .crashed_effect
                            .lock()
                            .expect("crashed effect lock poisoned") = Some(desc.clone());
                    }
                }
                cb.deliver(res);
            }
        }),
        curr_slot.clone(),
    );
    cb.set_cancel(Box::new({
        let settled = settled.clone();
        let curr_slot = curr_slot.clone();
        let monitor = core.env.monitor.clone();
        move || {
            if settled.swap(true, Ordering::SeqCst) {
                return;
            }
            let hook = curr_slot.lock().expect("cancel slot poisoned").take();
            if let Some(hook) = hook {
                hook();
            }
            if let Some(m) = &monitor {
                m.effect_cancelled(effect_id);
            }
        }
    }));
    run_effect_finalized(core, input, effect_id, curr_cb);
}

/// Apply the user-installed effect middlewares, outermost first.
fn run_effect_finalized(core: &Arc<ProcCore>, input: Yielded, effect_id: EffectId, cb: EffectCallback) {
    if core.env.middlewares.is_empty() {
        run_effect(core, input, effect_id, cb);
        return;
    }
    let inner_core = core.clone();
    let run: Box<dyn FnOnce(Yielded) + Send> =
        Box::new(move |item| run_effect(&inner_core, item, effect_id, cb));
    let chain = core
        .env
        .middlewares
        .iter()
        .rev()
        .fold(run, |next, middleware| {
            let middleware = middleware.clone();
            Box::new(move |item| middleware(item, next))
        });
    chain(input);
}

fn run_effect(core: &Arc<ProcCore>, input: Yielded, effect_id: EffectId, cb: EffectCallback) {
    match input {
        Yielded::Value(v) => cb.resolve(v),
        Yielded::Deferred(d) => run_deferred(d, cb),
        Yielded::Program(p) => {
            let name = p.name().to_string();
            proc(
                core.env.clone(),
                p,
                core.task.context().clone(),
                effect_id,
                name,
                false,
                Some(cb),
            );
        }
        Yielded::Effect(effect) => match effect {
            Effect::Take {
                channel,
                pattern,
                maybe,
            } => run_take(core, channel, pattern, maybe, cb),
            Effect::Put {
                channel,
                value,
                resolve,
            } => run_put(core, channel, value, resolve, cb),
            Effect::Call { name: _, f, args } => run_call(core, f, args, effect_id, cb),
            Effect::Cps { name: _, f, args } => run_cps(f, args, cb),
            Effect::Fork {
                name,
                f,
                args,
                detached,
            } => run_fork(core, name, f, args, detached, effect_id, cb),
            Effect::Join { task } => run_join(task, cb),
            Effect::Cancel { target } => run_cancel(core, target, cb),
            Effect::Select { name: _, f, args } => run_select(core, f, args, cb),
            Effect::ActionChannel { pattern, buffer } => {
                run_action_channel(core, pattern, buffer, cb)
            }
            Effect::Flush { channel } => run_flush(channel, cb),
            Effect::Cancelled => cb.resolve(Value::Bool(core.main.is_cancelled())),
            Effect::GetContext { key } => {
                cb.resolve(core.task.context().get(&key).unwrap_or(Value::None))
            }
            Effect::SetContext { entries } => {
                core.task.context().extend(entries);
                cb.resolve(Value::Unit);
            }
            Effect::All { shape } => run_all(core, shape, effect_id, cb),
            Effect::Race { shape } => run_race(core, shape, effect_id, cb),
        },
    }
}

fn run_take(core: &ProcCore, channel: Option<ChannelRef>, pattern: Pattern, maybe: bool, cb: EffectCallback) {
    let matcher = Matcher::compile(&pattern);
    let take_cb = EffectCallback::new(Arc::new({
        let cb = cb.clone();
        move |res: EffectResult| match res {
            Ok(v) if v.is_end_envelope() && !maybe => cb.resolve(Value::End),
            other => cb.deliver(other),
        }
    }));
    match channel {
        Some(ch) => ch.take(take_cb.clone(), matcher),
        None => core.env.std_channel.take(take_cb.clone(), matcher),
    }
    cb.set_cancel(Box::new(move || take_cb.cancel()));
}

fn run_put(core: &ProcCore, channel: Option<ChannelRef>, value: Value, resolve: bool, cb: EffectCallback) {
    // Scheduled so takers reacting to the input currently in flight all
    // finish before this one lands. Puts are non-cancellable.
    let env = core.env.clone();
    core.env.scheduler.asap(Box::new(move || {
        let result: EffectResult = match &channel {
            None => match value {
                Value::Action(action) => Ok((env.dispatch)(action)),
                other => {
                    Err(crate::error::RuntimeError::invalid_dispatch(other.describe()).into())
                }
            },
            Some(ch) => ch.put(value).map(|_| Value::Unit).map_err(TaskError::from),
        };
        match result {
            Ok(Value::Deferred(d)) if resolve => run_deferred(d, cb),
            other => cb.deliver(other),
        }
    }));
}

fn run_call(core: &Arc<ProcCore>, f: CallFn, args: Vec<Value>, effect_id: EffectId, cb: EffectCallback) {
    match f(args) {
        Err(e) => cb.reject(e),
        Ok(CallOutcome::Value(v)) => cb.resolve(v),
        Ok(CallOutcome::Deferred(d)) => run_deferred(d, cb),
        Ok(CallOutcome::Program(p)) => {
            let name = p.name().to_string();
            proc(
                core.env.clone(),
                p,
                core.task.context().clone(),
                effect_id,
                name,
                false,
                Some(cb),
            );
        }
    }
}

fn run_fork(
    core: &Arc<ProcCore>,
    name: String,
    f: ForkFn,
    args: Vec<Value>,
    detached: bool,
    effect_id: EffectId,
    cb: EffectCallback,
) {
    let program: ProgramBox = match f(args) {
        Ok(p) => p,
        Err(e) => Box::new(FailedProgram::new(name.clone(), e)),
    };
    // The child's first slice runs with the scheduler held, so any puts it
    // issues synchronously cannot overtake the taker that spawned it.
    let child = core.env.scheduler.immediately(|| {
        proc(
            core.env.clone(),
            program,
            core.task.context().clone(),
            effect_id,
            name,
            detached,
            None,
        )
    });
    if detached {
        cb.resolve(Value::Task(child));
    } else if child.is_running() {
        core.queue.add_task(child.clone());
        cb.resolve(Value::Task(child));
    } else if child.is_aborted() {
        core.queue.abort(
            child
                .error()
                .unwrap_or_else(|| TaskError::new("forked task aborted")),
        );
    } else {
        cb.resolve(Value::Task(child));
    }
}

fn run_cancel(core: &ProcCore, target: CancelTarget, cb: EffectCallback) {
    match target {
        CancelTarget::Own => core.task.cancel(),
        CancelTarget::One(t) => {
            if t.is_running() {
                t.cancel();
            }
        }
        CancelTarget::Many(tasks) => {
            for t in tasks {
                if t.is_running() {
                    t.cancel();
                }
            }
        }
    }
    // Cancels are non-cancellable and complete synchronously; this is a
    // no-op if the cancellation already tore this effect down.
    cb.resolve(Value::Unit);
}

fn run_select(core: &ProcCore, f: SelectFn, args: Vec<Value>, cb: EffectCallback) {
    let state = (core.env.get_state)();
    match f(&state, &args) {
        Ok(v) => cb.resolve(v),
        Err(e) => cb.reject(e),
    }
}

fn run_action_channel(core: &ProcCore, pattern: Pattern, buffer: Option<Buffer>, cb: EffectCallback) {
    let chan = Channel::new(buffer.unwrap_or_else(Buffer::expanding));
    let matcher = Matcher::compile(&pattern);
    let taker_slot: Arc<Mutex<Option<EffectCallback>>> = Arc::new(Mutex::new(None));
    let taker = EffectCallback::new(Arc::new({
        let env = core.env.clone();
        let chan = chan.clone();
        let matcher = matcher.clone();
        let slot = taker_slot.clone();
        move |res: EffectResult| {
            if let Ok(v) = res {
                // Re-arm before mirroring, so matches delivered while this
                // one is being buffered keep their order.
                if !v.is_end_envelope() {
                    let me = slot
                        .lock()
                        .expect("action channel taker slot poisoned")
                        .clone();
                    if let Some(me) = me {
                        env.std_channel.take(me, matcher.clone());
                    }
                }
                let _ = chan.put(v);
            }
        }
    }));
    *taker_slot
        .lock()
        .expect("action channel taker slot poisoned") = Some(taker.clone());
    chan.set_close_hook(Box::new({
        let taker = taker.clone();
        move || taker.cancel()
    }));
    core.env.std_channel.take(taker, matcher);
    cb.resolve(Value::Channel(ChannelRef::Queue(chan)));
}

fn run_all(core: &Arc<ProcCore>, shape: ComboShape, effect_id: EffectId, cb: EffectCallback) {
    let is_list = matches!(shape, ComboShape::List(_));
    let entries: Vec<(String, Yielded)> = match shape {
        ComboShape::List(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| (i.to_string(), item))
            .collect(),
        ComboShape::Named(items) => items,
    };
    let total = entries.len();
    if total == 0 {
        cb.resolve(empty_shape(is_list));
        return;
    }
    let keys: Arc<Vec<String>> = Arc::new(entries.iter().map(|(k, _)| k.clone()).collect());

    struct AllState {
        completed: bool,
        count: usize,
        results: Vec<Option<Value>>,
    }
    enum After {
        Nothing,
        Propagate(EffectResult),
        Complete(Vec<Option<Value>>),
    }
    let state = Arc::new(Mutex::new(AllState {
        completed: false,
        count: 0,
        results: vec![None; total],
    }));

    let child_cbs: Vec<EffectCallback> = (0..total)
        .map(|i| {
            EffectCallback::new(Arc::new({
                let state = state.clone();
                let cb = cb.clone();
                let keys = keys.clone();
                move |res: EffectResult| {
                    let after = {
                        let mut s = state.lock().expect("all state poisoned");
                        if s.completed {
                            return;
                        }
                        match res {
                            Err(_) | Ok(Value::End) | Ok(Value::TaskCancel) => {
                                After::Propagate(res)
                            }
                            Ok(v) => {
                                s.results[i] = Some(v);
                                s.count += 1;
                                if s.count == s.results.len() {
                                    s.completed = true;
                                    After::Complete(std::mem::take(&mut s.results))
                                } else {
                                    After::Nothing
                                }
                            }
                        }
                    };
                    match after {
                        After::Nothing => {}
                        After::Propagate(res) => {
                            cb.cancel();
                            cb.deliver(res);
                        }
                        After::Complete(results) => {
                            cb.resolve(assemble_shape(is_list, &keys, results));
                        }
                    }
                }
            }))
        })
        .collect();

    cb.set_cancel(Box::new({
        let state = state.clone();
        let children = child_cbs.clone();
        move || {
            let fire = {
                let mut s = state.lock().expect("all state poisoned");
                if s.completed {
                    false
                } else {
                    s.completed = true;
                    true
                }
            };
            if fire {
                for child in &children {
                    child.cancel();
                }
            }
        }
    }));

    for (i, (key, item)) in entries.into_iter().enumerate() {
        digest(core, item, effect_id, child_cbs[i].clone(), &key);
    }
}

fn run_race(core: &Arc<ProcCore>, shape: ComboShape, effect_id: EffectId, cb: EffectCallback) {
    let is_list = matches!(shape, ComboShape::List(_));
    let entries: Vec<(String, Yielded)> = match shape {
        ComboShape::List(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| (i.to_string(), item))
            .collect(),
        ComboShape::Named(items) => items,
    };
    let total = entries.len();
    let completed = Arc::new(Mutex::new(false));

    let child_cbs: Vec<EffectCallback> = (0..total)
        .map(|i| {
            let key = entries[i].0.clone();
            EffectCallback::new(Arc::new({
                let completed = completed.clone();
                let cb = cb.clone();
                move |res: EffectResult| {
                    if *completed.lock().expect("race state poisoned") {
                        return;
                    }
                    match res {
                        Err(_) | Ok(Value::End) | Ok(Value::TaskCancel) => {
                            cb.cancel();
                            cb.deliver(res);
                        }
                        Ok(v) => {
                            // Cancel the losers, then answer with the winner
                            // wrapped in its key.
                            cb.cancel();
                            let response = if is_list {
                                let mut slots = vec![Value::None; total];
                                slots[i] = v;
                                Value::List(slots)
                            } else {
                                let mut map = BTreeMap::new();
                                map.insert(key.clone(), v);
                                Value::Map(map)
                            };
                            cb.resolve(response);
                        }
                    }
                }
            }))
        })
        .collect();

    cb.set_cancel(Box::new({
        let completed = completed.clone();
        let children = child_cbs.clone();
        move || {
            let fire = {
                let mut done = completed.lock().expect("race state poisoned");
                if *done {
                    false
                } else {
                    *done = true;
                    true
                }
            };
            if fire {
                for child in &children {
                    child.cancel();
                }
            }
        }
    }));

    for (i, (key, item)) in entries.into_iter().enumerate() {
        if *completed.lock().expect("race state poisoned") {
            break;
        }
        digest(core, item, effect_id, child_cbs[i].clone(), &key);
    }
}

fn run_deferred(d: Deferred, cb: EffectCallback) {
    d.on_settle({
        let cb = cb.clone();
        move |res| cb.deliver(res)
    });
    cb.set_cancel(Box::new(move || d.cancel()));
}

fn run_cps(f: CpsFn, args: Vec<Value>, cb: EffectCallback) {
    let handle = CpsCallback::new(cb.clone());
    if let Err(e) = f(args, handle) {
        cb.reject(e);
    }
}

fn run_join(task: Task, cb: EffectCallback) {
    match task.try_add_joiner(cb.clone()) {
        Some(id) => {
            cb.set_cancel(Box::new(move || task.remove_joiner(id)));
        }
        None => {
            if let Some(outcome) = task.outcome() {
                cb.deliver(outcome);
            }
        }
    }
}

fn run_flush(channel: ChannelRef, cb: EffectCallback) {
    if let Err(e) = channel.flush(cb.clone()) {
        cb.reject(e.into());
    }
}

fn empty_shape(is_list: bool) -> Value {
    if is_list {
        Value::List(Vec::new())
    } else {
        Value::Map(BTreeMap::new())
    }
}

fn assemble_shape(is_list: bool, keys: &[String], results: Vec<Option<Value>>) -> Value {
    if is_list {
        Value::List(
            results
                .into_iter()
                .map(|r| r.unwrap_or(Value::None))
                .collect(),
        )
    } else {
        let mut map = BTreeMap::new();
        for (key, result) in keys.iter().zip(results) {
            map.insert(key.clone(), result.unwrap_or(Value::None));
        }
        Value::Map(map)
    }
}

#[cfg(test)]
#[path = "proc_tests.rs"]
mod proc_tests;
