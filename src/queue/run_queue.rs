//! The scheduler's run queue: a bounded ring backed by an overflow queue.
//!
//! Pushes always try the ring first and spill whatever does not fit. Pops
//! prefer the ring, but every [`OVERFLOW_POLL_INTERVAL`]-th pop made by a
//! worker checks the overflow queue first, so a spilled fiber runs after a
//! bounded number of dispatches even if the ring never drains.

use super::bounded::BoundedQueue;
use super::overflow::OverflowQueue;
use std::collections::VecDeque;

/// How often (in pops per worker) the overflow queue is served ahead of the ring.
pub const OVERFLOW_POLL_INTERVAL: u32 = 61;

/// Where a single push landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Lock-free fast path.
    Bounded,
    /// Ring was full; the element went to the overflow queue.
    Overflow,
}

/// How a batch push was split between the two tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchPlacement {
    /// Elements accepted by the ring.
    pub bounded: usize,
    /// Elements routed to the overflow queue.
    pub overflow: usize,
}

impl BatchPlacement {
    /// Total number of elements pushed.
    pub fn total(&self) -> usize {
        self.bounded + self.overflow
    }
}

/// One logical set of runnable items split across two tiers.
pub struct RunQueue<T> {
    bounded: BoundedQueue<T>,
    overflow: OverflowQueue<T>,
}

impl<T> RunQueue<T> {
    /// Creates a run queue whose ring holds `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        Self {
            bounded: BoundedQueue::new(capacity),
            overflow: OverflowQueue::new(),
        }
    }

    /// Pushes one element, never dropping it.
    pub fn push(&self, value: T) -> Placement {
        match self.bounded.push(value) {
            Ok(()) => Placement::Bounded,
            Err(value) => {
                self.overflow.push(value);
                Placement::Overflow
            }
        }
    }

    /// Pushes every element of `batch`; the prefix that fits goes to the ring,
    /// the rest keeps its order in the overflow queue. `batch` is left empty.
    pub fn push_batch(&self, batch: &mut VecDeque<T>) -> BatchPlacement {
        let bounded = self.bounded.push_batch(batch);
        let overflow = self.overflow.push_batch(batch);
        BatchPlacement { bounded, overflow }
    }

    /// Pops the next runnable element.
    ///
    /// `tick` is the caller's own pop counter; it decides when the overflow
    /// queue is served first.
    pub fn pop(&self, tick: u32) -> Option<T> {
        if tick % OVERFLOW_POLL_INTERVAL == 0 {
            if let Some(value) = self.overflow.pop() {
                return Some(value);
            }
        }
        self.bounded.pop().or_else(|| self.overflow.pop())
    }

    /// Approximate number of queued elements across both tiers.
    pub fn len(&self) -> usize {
        self.bounded.len() + self.overflow.len()
    }

    /// Returns true if both tiers look empty.
    pub fn is_empty(&self) -> bool {
        self.bounded.is_empty() && self.overflow.is_empty()
    }

    /// Capacity of the lock-free ring.
    pub fn capacity(&self) -> usize {
        self.bounded.capacity()
    }

    /// Number of elements currently in the overflow queue.
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }
}
