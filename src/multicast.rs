//! Pattern-matching broadcast channel.
//!
//! Every taker carries a compiled match predicate. A put walks a snapshot of
//! the taker list taken at entry; takers registered or removed during the
//! walk only affect the next put. The snapshot is two `Arc` references with
//! copy-on-write, not a lock held across callbacks.

use std::sync::{Arc, Mutex};

use crate::callback::EffectCallback;
use crate::ids::{ChannelId, TakerId};
use crate::matcher::Matcher;
use crate::scheduler::Scheduler;
use crate::value::{Action, Value};

#[derive(Clone)]
struct MulticastTaker {
    id: TakerId,
    matcher: Matcher,
    cb: EffectCallback,
}

struct MulticastState {
    closed: bool,
    /// Snapshot being iterated by the put in flight, if any.
    current: Arc<Vec<MulticastTaker>>,
    /// Where registrations and removals land; diverges from `current` on
    /// first write during a put.
    next: Arc<Vec<MulticastTaker>>,
}

/// A broadcast channel with per-taker predicates and no buffering.
#[derive(Clone)]
pub struct MulticastChannel {
    id: ChannelId,
    state: Arc<Mutex<MulticastState>>,
}

impl MulticastChannel {
    pub fn new() -> Self {
        let empty = Arc::new(Vec::new());
        MulticastChannel {
            id: ChannelId::fresh(),
            state: Arc::new(Mutex::new(MulticastState {
                closed: false,
                current: empty.clone(),
                next: empty,
            })),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MulticastState> {
        self.state.lock().expect("multicast channel lock poisoned")
    }

    /// Deliver `input` to every matching taker in the entry snapshot, each
    /// at most once. The END envelope closes the channel instead.
    pub fn put(&self, input: Value) {
        if input.is_end_envelope() {
            self.close();
            return;
        }
        let snapshot = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.current = state.next.clone();
            state.current.clone()
        };
        for taker in snapshot.iter() {
            if taker.matcher.matches(&input) {
                // Detach first so a re-registration from inside the callback
                // lands in next_takers rather than firing twice.
                taker.cb.cancel();
                taker.cb.resolve(input.clone());
            }
        }
    }

    /// Register `cb` with a match predicate; delivers END synchronously if
    /// the channel is already closed. Installs a once-only detach as the
    /// callback's cancel hook.
    pub(crate) fn take(&self, cb: EffectCallback, matcher: Matcher) {
        let closed = {
            let mut state = self.lock();
            if state.closed {
                true
            } else {
                let id = TakerId::fresh();
                Arc::make_mut(&mut state.next).push(MulticastTaker {
                    id,
                    matcher,
                    cb: cb.clone(),
                });
                cb.set_cancel(Box::new({
                    let chan = self.clone();
                    move || chan.remove_taker(id)
                }));
                false
            }
        };
        if closed {
            cb.resolve(Value::Action(Action::end()));
        }
    }

    /// Close the channel and broadcast END to the current snapshot.
    pub fn close(&self) {
        let snapshot = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.current = state.next.clone();
            state.next = Arc::new(Vec::new());
            state.current.clone()
        };
        for taker in snapshot.iter() {
            taker.cb.resolve(Value::Action(Action::end()));
        }
    }

    fn remove_taker(&self, id: TakerId) {
        let mut state = self.lock();
        Arc::make_mut(&mut state.next).retain(|t| t.id != id);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn taker_count(&self) -> usize {
        self.lock().next.len()
    }
}

impl Default for MulticastChannel {
    fn default() -> Self {
        MulticastChannel::new()
    }
}

impl std::fmt::Debug for MulticastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MulticastChannel")
            .field("id", &self.id.raw())
            .field("closed", &state.closed)
            .field("takers", &state.next.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Standard channel: the multicast channel actions are dispatched into
// ---------------------------------------------------------------------------

/// The runtime's standard channel. External inputs are deferred through the
/// scheduler so a put issued while a taker is running cannot preempt it;
/// actions flagged as internal are already ordered by the scheduler and
/// pass through synchronously.
#[derive(Clone, Debug)]
pub struct StdChannel {
    chan: MulticastChannel,
    scheduler: Scheduler,
}

impl StdChannel {
    pub fn new(chan: MulticastChannel, scheduler: Scheduler) -> Self {
        StdChannel { chan, scheduler }
    }

    pub fn put(&self, action: Action) {
        if action.internal {
            self.chan.put(Value::Action(action));
            return;
        }
        let chan = self.chan.clone();
        self.scheduler
            .asap(Box::new(move || chan.put(Value::Action(action))));
    }

    pub(crate) fn take(&self, cb: EffectCallback, matcher: Matcher) {
        self.chan.take(cb, matcher);
    }

    pub fn close(&self) {
        self.chan.close();
    }

    pub fn multicast(&self) -> &MulticastChannel {
        &self.chan
    }
}
