//! Bounded lock-free MPMC ring buffer.
//!
//! Dmitry Vyukov's bounded queue: every slot carries a sequence number that
//! tells producers and consumers which lap the slot belongs to. A producer at
//! position `p` may write the slot once its sequence equals `p`; a consumer at
//! `p` may read it once the sequence equals `p + 1`. Claiming a position is a
//! single CAS on the shared cursor, publishing is a release store of the
//! sequence, so no operation ever blocks or allocates.
//!
//! Batch operations claim a run of contiguous positions with one CAS, which is
//! what makes waking N fibers cost one round of cursor contention instead of N.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity multi-producer multi-consumer queue.
pub struct BoundedQueue<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

// SAFETY: a value is written by exactly one producer (the one whose CAS claimed
// the position) and read by exactly one consumer; the sequence store/load pair
// orders the two accesses.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

#[inline]
fn lap_distance(sequence: usize, pos: usize) -> isize {
    sequence.wrapping_sub(pos) as isize
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two or is smaller than 2.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "BoundedQueue capacity must be a power of two >= 2"
        );
        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Maximum number of elements the queue holds.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Approximate number of queued elements.
    ///
    /// Exact when no push or pop is in flight.
    pub fn len(&self) -> usize {
        let head = self.dequeue_pos.load(Ordering::SeqCst);
        let tail = self.enqueue_pos.load(Ordering::SeqCst);
        tail.wrapping_sub(head).min(self.capacity())
    }

    /// Returns true if no element is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn slot(&self, pos: usize) -> &Slot<T> {
        &self.buffer[pos & self.mask]
    }

    /// Attempts to enqueue `value`, handing it back if the queue is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(pos);
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = lap_distance(seq, pos);

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS gave this producer exclusive access to the slot
                        // until the sequence store below publishes it.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // The slot still holds an element from the previous lap.
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueues a prefix of `batch`, in order, and returns how many elements
    /// were accepted.
    ///
    /// Accepted elements are removed from the front of `batch`; whatever did
    /// not fit stays there for the caller to route elsewhere. All accepted
    /// positions are claimed with a single CAS and each element becomes visible
    /// to consumers individually as its slot is published.
    pub fn push_batch(&self, batch: &mut VecDeque<T>) -> usize {
        let wanted = batch.len();
        if wanted == 0 {
            return 0;
        }

        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        'claim: loop {
            let mut free = 0;
            while free < wanted {
                let target = pos.wrapping_add(free);
                let seq = self.slot(target).sequence.load(Ordering::Acquire);
                let diff = lap_distance(seq, target);
                if diff == 0 {
                    free += 1;
                } else if diff < 0 {
                    break;
                } else {
                    // Another producer already moved past `pos`.
                    pos = self.enqueue_pos.load(Ordering::Relaxed);
                    continue 'claim;
                }
            }

            if free == 0 {
                return 0;
            }

            match self.enqueue_pos.compare_exchange_weak(
                pos,
                pos.wrapping_add(free),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    for offset in 0..free {
                        let target = pos.wrapping_add(offset);
                        let slot = self.slot(target);
                        let value = batch.pop_front().expect("batch shrank during push");
                        // SAFETY: positions pos..pos+free were observed free and then
                        // claimed by the CAS above; nobody else can touch them.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence
                            .store(target.wrapping_add(1), Ordering::Release);
                    }
                    return free;
                }
                Err(current) => pos = current,
            }
        }
    }

    /// Attempts to dequeue one element.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(pos);
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = lap_distance(seq, pos.wrapping_add(1));

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the slot was published for this lap and the CAS made
                        // this consumer its only reader.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Empty, or the producer of this slot has not published yet.
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeues up to `max` contiguous published elements with one CAS,
    /// appending them to `out` in queue order. Returns how many were taken.
    pub fn pop_batch(&self, out: &mut VecDeque<T>, max: usize) -> usize {
        if max == 0 {
            return 0;
        }

        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        'claim: loop {
            let mut ready = 0;
            while ready < max {
                let target = pos.wrapping_add(ready);
                let seq = self.slot(target).sequence.load(Ordering::Acquire);
                let diff = lap_distance(seq, target.wrapping_add(1));
                if diff == 0 {
                    ready += 1;
                } else if diff < 0 {
                    break;
                } else {
                    pos = self.dequeue_pos.load(Ordering::Relaxed);
                    continue 'claim;
                }
            }

            if ready == 0 {
                return 0;
            }

            match self.dequeue_pos.compare_exchange_weak(
                pos,
                pos.wrapping_add(ready),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    for offset in 0..ready {
                        let target = pos.wrapping_add(offset);
                        let slot = self.slot(target);
                        // SAFETY: every claimed slot was observed published for this lap.
                        out.push_back(unsafe { (*slot.value.get()).assume_init_read() });
                        slot.sequence
                            .store(target.wrapping_add(self.mask + 1), Ordering::Release);
                    }
                    return ready;
                }
                Err(current) => pos = current,
            }
        }
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
