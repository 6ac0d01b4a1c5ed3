//! Deadline-ordered timeouts.
//!
//! Entries live in a `BTreeMap` keyed by deadline plus a sequence number, so
//! registration and cancellation are O(log n) and expired entries come off the
//! front in one split. There is no timer thread: workers poll the facility
//! between dispatches and size their park timeout from [`TimerFacility::next_deadline`].
//!
//! Firing happens after the map lock is released. A target may therefore take
//! other locks (a condition variable's wait list, the fiber table) without
//! ordering against the timer lock.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const NO_DEADLINE: u64 = u64::MAX;

/// Something to do when a deadline passes.
pub(crate) trait TimerTarget: Send + Sync {
    fn fire(&self);
}

/// Handle to a registered timeout, used for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TimerKey {
    deadline: Instant,
    seq: u64,
}

impl TimerKey {
    #[cfg(test)]
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }
}

pub(crate) struct TimerFacility {
    entries: Mutex<BTreeMap<TimerKey, Arc<dyn TimerTarget>>>,
    next_seq: AtomicU64,
    /// Earliest pending deadline in nanoseconds since `base`, or `NO_DEADLINE`.
    /// Lets idle workers skip the lock when nothing can be due.
    next_deadline: AtomicU64,
    base: Instant,
}

impl TimerFacility {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            next_deadline: AtomicU64::new(NO_DEADLINE),
            base: Instant::now(),
        }
    }

    fn nanos_since_base(&self, at: Instant) -> u64 {
        let nanos = at.saturating_duration_since(self.base).as_nanos();
        u64::try_from(nanos).unwrap_or(NO_DEADLINE - 1)
    }

    /// Registers `target` to fire at `deadline`.
    ///
    /// The second value is true when the new entry became the earliest one, in
    /// which case a parked worker should be woken to shorten its sleep.
    pub(crate) fn register(
        &self,
        deadline: Instant,
        target: Arc<dyn TimerTarget>,
    ) -> (TimerKey, bool) {
        let key = TimerKey {
            deadline,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let mut entries = self.entries.lock();
        entries.insert(key, target);
        let earliest = entries.first_key_value().map(|(k, _)| *k) == Some(key);
        if earliest {
            self.next_deadline
                .store(self.nanos_since_base(deadline), Ordering::SeqCst);
        }
        (key, earliest)
    }

    /// Removes a pending entry. Returns false if it already fired or was
    /// cancelled before; that is not an error.
    pub(crate) fn cancel(&self, key: TimerKey) -> bool {
        let mut entries = self.entries.lock();
        let removed = entries.remove(&key).is_some();
        if removed {
            self.refresh_next_deadline(&entries);
        }
        removed
    }

    fn refresh_next_deadline(&self, entries: &BTreeMap<TimerKey, Arc<dyn TimerTarget>>) {
        let next = entries
            .first_key_value()
            .map_or(NO_DEADLINE, |(k, _)| self.nanos_since_base(k.deadline));
        self.next_deadline.store(next, Ordering::SeqCst);
    }

    /// Fires every entry whose deadline is at or before `now` and returns how
    /// many fired.
    ///
    /// Skips the pass if another worker is already polling.
    pub(crate) fn poll(&self, now: Instant) -> usize {
        let next = self.next_deadline.load(Ordering::SeqCst);
        if next == NO_DEADLINE || next > self.nanos_since_base(now) {
            return 0;
        }
        let Some(mut entries) = self.entries.try_lock() else {
            return 0;
        };
        let pending = entries.split_off(&TimerKey {
            deadline: now,
            seq: u64::MAX,
        });
        let expired = std::mem::replace(&mut *entries, pending);
        self.refresh_next_deadline(&entries);
        drop(entries);

        let fired = expired.len();
        for target in expired.into_values() {
            target.fire();
        }
        if fired > 0 {
            tracing::trace!(fired, "timers expired");
        }
        fired
    }

    /// Earliest pending deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match self.next_deadline.load(Ordering::SeqCst) {
            NO_DEADLINE => None,
            nanos => Some(self.base + Duration::from_nanos(nanos)),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
