//! FIFO buffers used by channels.
//!
//! Buffers are owned exclusively by a channel; the channel's lock is the
//! synchronization boundary, the buffer itself is plain data.

use std::collections::VecDeque;

use crate::error::RuntimeError;
use crate::value::Value;

/// Overflow policy of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferKind {
    /// Zero capacity: every put is dropped.
    None,
    /// Reject puts with an error once full.
    Fixed(usize),
    /// Silently drop new items once full.
    Dropping(usize),
    /// Evict the oldest item to make room.
    Sliding(usize),
    /// Unbounded.
    Expanding,
}

/// A FIFO container with one of five overflow policies.
#[derive(Debug, Clone)]
pub struct Buffer {
    kind: BufferKind,
    items: VecDeque<Value>,
}

impl Buffer {
    /// Zero-capacity buffer: always "full" with respect to put.
    pub fn none() -> Self {
        Buffer {
            kind: BufferKind::None,
            items: VecDeque::new(),
        }
    }

    /// Bounded buffer that rejects puts when full.
    pub fn fixed(capacity: usize) -> Self {
        Buffer {
            kind: BufferKind::Fixed(capacity),
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Bounded buffer that silently drops new items when full.
    pub fn dropping(capacity: usize) -> Self {
        Buffer {
            kind: BufferKind::Dropping(capacity),
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Bounded buffer that evicts the oldest item when full.
    pub fn sliding(capacity: usize) -> Self {
        Buffer {
            kind: BufferKind::Sliding(capacity),
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Unbounded buffer.
    pub fn expanding() -> Self {
        Buffer {
            kind: BufferKind::Expanding,
            items: VecDeque::new(),
        }
    }

    pub fn put(&mut self, value: Value) -> Result<(), RuntimeError> {
        match self.kind {
            BufferKind::None => Ok(()),
            BufferKind::Fixed(cap) => {
                if self.items.len() >= cap {
                    return Err(RuntimeError::buffer_overflow(cap));
                }
                self.items.push_back(value);
                Ok(())
            }
            BufferKind::Dropping(cap) => {
                if self.items.len() < cap {
                    self.items.push_back(value);
                }
                Ok(())
            }
            BufferKind::Sliding(cap) => {
                if cap > 0 {
                    if self.items.len() >= cap {
                        self.items.pop_front();
                    }
                    self.items.push_back(value);
                }
                Ok(())
            }
            BufferKind::Expanding => {
                self.items.push_back(value);
                Ok(())
            }
        }
    }

    pub fn take(&mut self) -> Option<Value> {
        self.items.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Drain every buffered item in FIFO order.
    pub fn flush(&mut self) -> Vec<Value> {
        self.items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ints(buffer: &mut Buffer) -> Vec<i64> {
        buffer.flush().iter().filter_map(Value::as_int).collect()
    }

    #[test]
    fn test_none_drops_everything() {
        let mut b = Buffer::none();
        b.put(Value::Int(1)).unwrap();
        assert!(b.is_empty());
        assert!(b.take().is_none());
    }

    #[test]
    fn test_fixed_rejects_when_full() {
        let mut b = Buffer::fixed(2);
        b.put(Value::Int(1)).unwrap();
        b.put(Value::Int(2)).unwrap();
        let err = b.put(Value::Int(3)).unwrap_err();
        assert_eq!(err, RuntimeError::buffer_overflow(2));
        assert_eq!(ints(&mut b), vec![1, 2]);
    }

    #[test]
    fn test_dropping_drops_new() {
        let mut b = Buffer::dropping(2);
        b.put(Value::Int(1)).unwrap();
        b.put(Value::Int(2)).unwrap();
        b.put(Value::Int(3)).unwrap();
        assert_eq!(ints(&mut b), vec![1, 2]);
    }

    #[test]
    fn test_sliding_evicts_oldest() {
        let mut b = Buffer::sliding(2);
        b.put(Value::Int(1)).unwrap();
        b.put(Value::Int(2)).unwrap();
        b.put(Value::Int(3)).unwrap();
        assert_eq!(ints(&mut b), vec![2, 3]);
    }

    #[test]
    fn test_expanding_is_unbounded() {
        let mut b = Buffer::expanding();
        for i in 0..100 {
            b.put(Value::Int(i)).unwrap();
        }
        assert_eq!(b.len(), 100);
    }

    #[test]
    fn test_take_is_fifo() {
        let mut b = Buffer::expanding();
        b.put(Value::Int(1)).unwrap();
        b.put(Value::Int(2)).unwrap();
        assert_eq!(b.take().and_then(|v| v.as_int()), Some(1));
        assert_eq!(b.take().and_then(|v| v.as_int()), Some(2));
        assert!(b.take().is_none());
    }

    proptest! {
        // An expanding buffer reproduces every put in FIFO order.
        #[test]
        fn prop_expanding_preserves_fifo(
            values in proptest::collection::vec(any::<i64>(), 0..50),
        ) {
            let mut b = Buffer::expanding();
            for &v in &values {
                b.put(Value::Int(v)).unwrap();
            }
            let drained: Vec<i64> =
                std::iter::from_fn(|| b.take()).filter_map(|v| v.as_int()).collect();
            prop_assert_eq!(drained, values);
        }

        // Bounded buffers never exceed capacity: fixed rejects exactly the
        // puts that arrive full, dropping keeps the oldest items, sliding
        // keeps the newest, and survivors stay in put order.
        #[test]
        fn prop_bounded_buffers_respect_capacity_and_order(
            cap in 1usize..6,
            values in proptest::collection::vec(0i64..100, 0..30),
        ) {
            let mut fixed = Buffer::fixed(cap);
            let mut dropping = Buffer::dropping(cap);
            let mut sliding = Buffer::sliding(cap);
            for &v in &values {
                let was_full = fixed.len() == cap;
                prop_assert_eq!(fixed.put(Value::Int(v)).is_err(), was_full);
                dropping.put(Value::Int(v)).unwrap();
                sliding.put(Value::Int(v)).unwrap();
                prop_assert!(fixed.len() <= cap);
                prop_assert!(dropping.len() <= cap);
                prop_assert!(sliding.len() <= cap);
            }
            let oldest: Vec<i64> = values.iter().take(cap).copied().collect();
            let newest: Vec<i64> = values.iter().rev().take(cap).rev().copied().collect();
            prop_assert_eq!(ints(&mut fixed), oldest.clone());
            prop_assert_eq!(ints(&mut dropping), oldest);
            prop_assert_eq!(ints(&mut sliding), newest);
        }
    }
}
