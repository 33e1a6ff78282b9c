//! Core identifier types for the runtime.
//!
//! All IDs are lightweight Copy types using the newtype pattern for type
//! safety.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for tasks.
///
/// Every procedure started by the interpreter gets a fresh TaskId, whether it
/// is a root, an attached fork, or a detached spawn.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(pub u64);

/// Unique identifier for effect dispatches.
///
/// Assigned when the interpreter digests a yielded effect; reported to the
/// monitor so resolution and rejection can be correlated with triggering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EffectId(pub u64);

/// Unique identifier for takers registered on a channel.
///
/// Cancellation detaches a taker by id rather than by callback identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TakerId(pub u64);

/// Unique identifier for channels.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ChannelId(pub u64);

// Global counters for ID generation
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static EFFECT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static TAKER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static CHANNEL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Create a fresh unique TaskId.
    pub fn fresh() -> Self {
        TaskId(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Create a TaskId with a specific value (for testing).
    pub fn from_raw(value: u64) -> Self {
        TaskId(value)
    }
}

impl EffectId {
    /// Create a fresh unique EffectId.
    pub fn fresh() -> Self {
        EffectId(EFFECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Reserved id used as the parent of root effects.
    pub fn root() -> Self {
        EffectId(0)
    }

    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        EffectId(value)
    }
}

impl TakerId {
    /// Create a fresh unique TakerId.
    pub fn fresh() -> Self {
        TakerId(TAKER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl ChannelId {
    /// Create a fresh unique ChannelId.
    pub fn fresh() -> Self {
        ChannelId(CHANNEL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_fresh_is_unique() {
        let t1 = TaskId::fresh();
        let t2 = TaskId::fresh();
        assert_ne!(t1, t2);
    }

    #[test]
    fn test_effect_id_fresh_is_unique() {
        let e1 = EffectId::fresh();
        let e2 = EffectId::fresh();
        assert_ne!(e1, e2);
    }

    #[test]
    fn test_effect_id_root_is_reserved() {
        assert_eq!(EffectId::root().raw(), 0);
        assert_ne!(EffectId::fresh(), EffectId::root());
    }

    #[test]
    fn test_task_id_equality() {
        assert_eq!(TaskId::from_raw(42), TaskId::from_raw(42));
        assert_ne!(TaskId::from_raw(42), TaskId::from_raw(43));
    }
}
