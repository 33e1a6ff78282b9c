//! Single-consumer buffered channels and the event-channel adapter.
//!
//! A channel is a rendezvous between producers and one logical consumer:
//! a put delivers to the oldest waiting taker if any, otherwise buffers;
//! a take is satisfied synchronously from the buffer, from END if the
//! channel is closed, and suspends otherwise.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::callback::EffectCallback;
use crate::error::RuntimeError;
use crate::ids::{ChannelId, TakerId};
use crate::matcher::Matcher;
use crate::multicast::MulticastChannel;
use crate::value::{Action, Value};

pub(crate) struct QueueTaker {
    pub id: TakerId,
    pub cb: EffectCallback,
}

struct ChannelState {
    closed: bool,
    buffer: Buffer,
    takers: VecDeque<QueueTaker>,
    close_hook: Option<Box<dyn FnOnce() + Send>>,
}

impl ChannelState {
    fn check_forbidden_states(&self) {
        debug_assert!(
            !(self.closed && !self.takers.is_empty()),
            "channel closed with pending takers"
        );
        debug_assert!(
            self.takers.is_empty() || self.buffer.is_empty(),
            "channel has pending takers and a non-empty buffer"
        );
    }
}

/// A single-consumer buffered channel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    state: Arc<Mutex<ChannelState>>,
}

impl Channel {
    pub fn new(buffer: Buffer) -> Self {
        Channel {
            id: ChannelId::fresh(),
            state: Arc::new(Mutex::new(ChannelState {
                closed: false,
                buffer,
                takers: VecDeque::new(),
                close_hook: None,
            })),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().expect("channel lock poisoned")
    }

    /// Deliver `value` to the oldest waiting taker, or buffer it. Dropped
    /// silently if the channel is closed.
    pub fn put(&self, value: Value) -> Result<(), RuntimeError> {
        let taker = {
            let mut state = self.lock();
            state.check_forbidden_states();
            if state.closed {
                return Ok(());
            }
            match state.takers.pop_front() {
                Some(taker) => taker,
                None => return state.buffer.put(value),
            }
        };
        taker.cb.resolve(value);
        Ok(())
    }

    /// Register `cb` as a taker, or satisfy it synchronously from the
    /// buffer (or with END if closed and drained). Installs removal of the
    /// registration as the callback's cancel hook.
    pub(crate) fn take(&self, cb: EffectCallback) {
        let ready = {
            let mut state = self.lock();
            state.check_forbidden_states();
            if state.closed && state.buffer.is_empty() {
                Some(Value::Action(Action::end()))
            } else if let Some(value) = state.buffer.take() {
                Some(value)
            } else {
                let id = TakerId::fresh();
                state.takers.push_back(QueueTaker { id, cb: cb.clone() });
                cb.set_cancel(Box::new({
                    let chan = self.clone();
                    move || chan.remove_taker(id)
                }));
                None
            }
        };
        if let Some(value) = ready {
            cb.resolve(value);
        }
    }

    /// Deliver everything currently buffered (possibly an empty list), or
    /// END once if the channel is closed and drained.
    pub(crate) fn flush(&self, cb: EffectCallback) {
        let value = {
            let mut state = self.lock();
            state.check_forbidden_states();
            if state.closed && state.buffer.is_empty() {
                Value::Action(Action::end())
            } else {
                Value::List(state.buffer.flush())
            }
        };
        cb.resolve(value);
    }

    /// Close the channel: every outstanding taker observes END once.
    pub fn close(&self) {
        let (hook, takers) = {
            let mut state = self.lock();
            state.check_forbidden_states();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.close_hook.take(), std::mem::take(&mut state.takers))
        };
        if let Some(hook) = hook {
            hook();
        }
        for taker in takers {
            taker.cb.resolve(Value::Action(Action::end()));
        }
    }

    /// Install a hook that runs once at the start of `close`.
    pub(crate) fn set_close_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        self.lock().close_hook = Some(hook);
    }

    fn remove_taker(&self, id: TakerId) {
        self.lock().takers.retain(|t| t.id != id);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn taker_count(&self) -> usize {
        self.lock().takers.len()
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.lock().buffer.len()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Channel")
            .field("id", &self.id.raw())
            .field("closed", &state.closed)
            .field("buffered", &state.buffer.len())
            .field("takers", &state.takers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Event channel: adapts an external subscription into a channel
// ---------------------------------------------------------------------------

struct EventState {
    closed: bool,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

/// A channel fed by an external subscription. Emitting END closes it and
/// unsubscribes exactly once.
#[derive(Clone)]
pub struct EventChannel {
    chan: Channel,
    state: Arc<Mutex<EventState>>,
}

/// The emit half handed to an event channel's subscriber.
#[derive(Clone)]
pub struct Emitter {
    chan: Channel,
    state: Arc<Mutex<EventState>>,
}

impl Emitter {
    /// Route a value into the channel; the END envelope closes it instead.
    pub fn emit(&self, value: Value) {
        if value.is_end_envelope() {
            close_event(&self.chan, &self.state);
            return;
        }
        let _ = self.chan.put(value);
    }
}

fn close_event(chan: &Channel, state: &Arc<Mutex<EventState>>) {
    let unsubscribe = {
        let mut state = state.lock().expect("event channel lock poisoned");
        if state.closed {
            return;
        }
        state.closed = true;
        state.unsubscribe.take()
    };
    if let Some(unsubscribe) = unsubscribe {
        unsubscribe();
    }
    chan.close();
}

/// Build a channel from a `subscribe(emitter) -> unsubscribe` source.
pub fn event_channel<F>(subscribe: F, buffer: Buffer) -> EventChannel
where
    F: FnOnce(Emitter) -> Box<dyn FnOnce() + Send>,
{
    let chan = Channel::new(buffer);
    let state = Arc::new(Mutex::new(EventState {
        closed: false,
        unsubscribe: None,
    }));
    let emitter = Emitter {
        chan: chan.clone(),
        state: state.clone(),
    };
    let unsubscribe = subscribe(emitter);
    {
        let mut locked = state.lock().expect("event channel lock poisoned");
        if locked.closed {
            // END arrived during subscribe; unsubscribe was not yet stored.
            drop(locked);
            unsubscribe();
        } else {
            locked.unsubscribe = Some(unsubscribe);
        }
    }
    EventChannel { chan, state }
}

impl EventChannel {
    pub fn id(&self) -> ChannelId {
        self.chan.id()
    }

    pub(crate) fn take(&self, cb: EffectCallback) {
        self.chan.take(cb);
    }

    pub(crate) fn flush(&self, cb: EffectCallback) {
        self.chan.flush(cb);
    }

    /// Close and unsubscribe. Idempotent.
    pub fn close(&self) {
        close_event(&self.chan, &self.state);
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("chan", &self.chan)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ChannelRef: the channel handle effects and values carry
// ---------------------------------------------------------------------------

/// Any channel a take/put/flush effect can target.
#[derive(Clone, Debug)]
pub enum ChannelRef {
    Queue(Channel),
    Multicast(MulticastChannel),
    Event(EventChannel),
}

impl ChannelRef {
    pub fn id(&self) -> ChannelId {
        match self {
            ChannelRef::Queue(c) => c.id(),
            ChannelRef::Multicast(c) => c.id(),
            ChannelRef::Event(c) => c.id(),
        }
    }

    pub(crate) fn take(&self, cb: EffectCallback, matcher: Matcher) {
        match self {
            ChannelRef::Queue(c) => c.take(cb),
            ChannelRef::Multicast(c) => c.take(cb, matcher),
            ChannelRef::Event(c) => c.take(cb),
        }
    }

    pub(crate) fn put(&self, value: Value) -> Result<(), RuntimeError> {
        match self {
            ChannelRef::Queue(c) => c.put(value),
            ChannelRef::Multicast(c) => {
                c.put(value);
                Ok(())
            }
            ChannelRef::Event(_) => Err(RuntimeError::unsupported("put on an event channel")),
        }
    }

    pub(crate) fn flush(&self, cb: EffectCallback) -> Result<(), RuntimeError> {
        match self {
            ChannelRef::Queue(c) => {
                c.flush(cb);
                Ok(())
            }
            ChannelRef::Event(c) => {
                c.flush(cb);
                Ok(())
            }
            ChannelRef::Multicast(_) => {
                Err(RuntimeError::unsupported("flush on a multicast channel"))
            }
        }
    }

    pub fn close(&self) {
        match self {
            ChannelRef::Queue(c) => c.close(),
            ChannelRef::Multicast(c) => c.close(),
            ChannelRef::Event(c) => c.close(),
        }
    }
}

impl From<Channel> for ChannelRef {
    fn from(c: Channel) -> Self {
        ChannelRef::Queue(c)
    }
}

impl From<MulticastChannel> for ChannelRef {
    fn from(c: MulticastChannel) -> Self {
        ChannelRef::Multicast(c)
    }
}

impl From<EventChannel> for ChannelRef {
    fn from(c: EventChannel) -> Self {
        ChannelRef::Event(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn recording_cb() -> (Arc<Mutex<Vec<Value>>>, EffectCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb = EffectCallback::new(Arc::new({
            let seen = seen.clone();
            move |res| {
                if let Ok(v) = res {
                    seen.lock().unwrap().push(v)
                }
            }
        }));
        (seen, cb)
    }

    #[test]
    fn test_put_then_take_round_trips() {
        let chan = Channel::new(Buffer::expanding());
        chan.put(Value::Int(1)).unwrap();
        let (seen, cb) = recording_cb();
        chan.take(cb);
        assert_eq!(*seen.lock().unwrap(), vec![Value::Int(1)]);
    }

    #[test]
    fn test_take_suspends_until_put() {
        let chan = Channel::new(Buffer::expanding());
        let (seen, cb) = recording_cb();
        chan.take(cb);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(chan.taker_count(), 1);
        chan.put(Value::Int(2)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Value::Int(2)]);
        assert_eq!(chan.taker_count(), 0);
    }

    #[test]
    fn test_takers_are_fifo() {
        let chan = Channel::new(Buffer::expanding());
        let (seen1, cb1) = recording_cb();
        let (seen2, cb2) = recording_cb();
        chan.take(cb1);
        chan.take(cb2);
        chan.put(Value::Int(1)).unwrap();
        chan.put(Value::Int(2)).unwrap();
        assert_eq!(*seen1.lock().unwrap(), vec![Value::Int(1)]);
        assert_eq!(*seen2.lock().unwrap(), vec![Value::Int(2)]);
    }

    #[test]
    fn test_take_from_closed_empty_channel_yields_end() {
        let chan = Channel::new(Buffer::expanding());
        chan.close();
        let (seen, cb) = recording_cb();
        chan.take(cb);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(seen.lock().unwrap()[0].is_end_envelope());
    }

    #[test]
    fn test_close_delivers_end_to_all_takers() {
        let chan = Channel::new(Buffer::expanding());
        let (seen1, cb1) = recording_cb();
        let (seen2, cb2) = recording_cb();
        chan.take(cb1);
        chan.take(cb2);
        chan.close();
        assert!(seen1.lock().unwrap()[0].is_end_envelope());
        assert!(seen2.lock().unwrap()[0].is_end_envelope());
        assert_eq!(chan.taker_count(), 0);
    }

    #[test]
    fn test_closed_put_is_dropped() {
        let chan = Channel::new(Buffer::expanding());
        chan.close();
        chan.put(Value::Int(1)).unwrap();
        assert_eq!(chan.buffered_len(), 0);
    }

    #[test]
    fn test_cancel_removes_taker() {
        let chan = Channel::new(Buffer::expanding());
        let (seen, cb) = recording_cb();
        chan.take(cb.clone());
        assert_eq!(chan.taker_count(), 1);
        cb.cancel();
        assert_eq!(chan.taker_count(), 0);
        chan.put(Value::Int(1)).unwrap();
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(chan.buffered_len(), 1);
    }

    #[test]
    fn test_flush_drains_buffer() {
        let chan = Channel::new(Buffer::expanding());
        chan.put(Value::Int(1)).unwrap();
        chan.put(Value::Int(2)).unwrap();
        let (seen, cb) = recording_cb();
        chan.flush(cb);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Value::List(vec![Value::Int(1), Value::Int(2)])]
        );
        assert_eq!(chan.buffered_len(), 0);
    }

    #[test]
    fn test_flush_on_closed_drained_channel_is_end() {
        let chan = Channel::new(Buffer::expanding());
        chan.close();
        let (seen, cb) = recording_cb();
        chan.flush(cb);
        assert!(seen.lock().unwrap()[0].is_end_envelope());
    }

    #[test]
    fn test_event_channel_routes_values_and_end() {
        let unsubscribed = Arc::new(Mutex::new(0));
        let emitter_slot: Arc<Mutex<Option<Emitter>>> = Arc::new(Mutex::new(None));
        let chan = event_channel(
            {
                let emitter_slot = emitter_slot.clone();
                let unsubscribed = unsubscribed.clone();
                move |emitter| {
                    *emitter_slot.lock().unwrap() = Some(emitter);
                    Box::new(move || *unsubscribed.lock().unwrap() += 1)
                }
            },
            Buffer::expanding(),
        );
        let emitter = emitter_slot.lock().unwrap().clone().unwrap();
        emitter.emit(Value::Int(5));
        let (seen, cb) = recording_cb();
        chan.take(cb);
        assert_eq!(*seen.lock().unwrap(), vec![Value::Int(5)]);

        emitter.emit(Value::Action(Action::end()));
        assert!(chan.is_closed());
        assert_eq!(*unsubscribed.lock().unwrap(), 1);
        // closing again does not unsubscribe twice
        chan.close();
        assert_eq!(*unsubscribed.lock().unwrap(), 1);
    }

    #[test]
    fn test_event_channel_end_during_subscribe() {
        let unsubscribed = Arc::new(Mutex::new(0));
        let chan = event_channel(
            {
                let unsubscribed = unsubscribed.clone();
                move |emitter| {
                    emitter.emit(Value::Action(Action::end()));
                    Box::new(move || *unsubscribed.lock().unwrap() += 1)
                }
            },
            Buffer::expanding(),
        );
        assert!(chan.is_closed());
        assert_eq!(*unsubscribed.lock().unwrap(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(i64),
        Take,
        Close,
        CancelOldest,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..100).prop_map(Op::Put),
            Just(Op::Take),
            Just(Op::Close),
            Just(Op::CancelOldest),
        ]
    }

    proptest! {
        // After any interleaving of put/take/close/cancel:
        //   closed => takers is empty
        //   takers non-empty => buffer is empty
        #[test]
        fn prop_channel_invariants(ops in proptest::collection::vec(op_strategy(), 0..40)) {
            let chan = Channel::new(Buffer::expanding());
            let mut cancelables: Vec<EffectCallback> = Vec::new();
            for op in ops {
                match op {
                    Op::Put(i) => { chan.put(Value::Int(i)).unwrap(); }
                    Op::Take => {
                        let (_seen, cb) = recording_cb();
                        chan.take(cb.clone());
                        cancelables.push(cb);
                    }
                    Op::Close => chan.close(),
                    Op::CancelOldest => {
                        if !cancelables.is_empty() {
                            cancelables.remove(0).cancel();
                        }
                    }
                }
                if chan.is_closed() {
                    prop_assert_eq!(chan.taker_count(), 0);
                }
                if chan.taker_count() > 0 {
                    prop_assert_eq!(chan.buffered_len(), 0);
                }
            }
        }
    }
}
