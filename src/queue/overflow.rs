//! Unbounded fallback behind the bounded run queue.
//!
//! Only touched when the ring is full, so a plain lock around a `VecDeque` is
//! enough. The element count is mirrored in an atomic so that consumers can
//! skip the lock entirely while the fallback is empty, which is the common
//! case.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-protected FIFO with a lock-free emptiness check.
pub struct OverflowQueue<T> {
    items: Mutex<VecDeque<T>>,
    len: AtomicUsize,
}

impl<T> Default for OverflowQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OverflowQueue<T> {
    /// Creates an empty fallback queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Appends one element.
    pub fn push(&self, value: T) {
        let mut items = self.items.lock();
        items.push_back(value);
        self.len.store(items.len(), Ordering::SeqCst);
    }

    /// Moves every element of `batch` to the back of the queue, preserving order.
    pub fn push_batch(&self, batch: &mut VecDeque<T>) -> usize {
        let moved = batch.len();
        if moved == 0 {
            return 0;
        }
        let mut items = self.items.lock();
        items.append(batch);
        self.len.store(items.len(), Ordering::SeqCst);
        moved
    }

    /// Removes the oldest element.
    pub fn pop(&self) -> Option<T> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut items = self.items.lock();
        let value = items.pop_front();
        self.len.store(items.len(), Ordering::SeqCst);
        value
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_across_single_and_batch() {
        let queue = OverflowQueue::new();
        queue.push(1);
        let mut batch = VecDeque::from(vec![2, 3, 4]);
        assert_eq!(queue.push_batch(&mut batch), 3);
        assert!(batch.is_empty());
        queue.push(5);

        assert_eq!(queue.len(), 5);
        let drained: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4, 5]);
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }
}
