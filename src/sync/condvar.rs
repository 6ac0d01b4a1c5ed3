//! Fiber condition variable with optional timeout.
//!
//! Each wait creates a [`CondWaiter`] that sits on the wait list and, for
//! timed waits, is also referenced by a timer entry. Notify and timeout race
//! to claim the waiter with one compare-and-swap on its `claim` word. Only the
//! winner wakes the fiber; the loser unlinks whatever it can still reach and
//! otherwise does nothing.
//!
//! Registration happens after the waiting fiber is switched out (see
//! [`fiber::block_current`]). The waiter is linked and the mutex released while
//! the wait-list lock is held, so a notifier that acquires the mutex after the
//! release is guaranteed to see the waiter.

use crate::error::{TimedOut, invariant_violation, usage_error};
use crate::fiber::{self, BlockReason};
use crate::runtime::FiberWaker;
use crate::sync::mutex::{MutexGuard, RawMutex};
use crate::timer::{TimerKey, TimerTarget};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

const UNCLAIMED: u8 = 0;
const CLAIMED_BY_NOTIFY: u8 = 1;
const CLAIMED_BY_TIMEOUT: u8 = 2;

struct CondWaiter {
    claim: AtomicU8,
    waker: FiberWaker,
    timer: OnceLock<TimerKey>,
}

impl CondWaiter {
    fn try_claim(&self, by: u8) -> bool {
        self.claim
            .compare_exchange(UNCLAIMED, by, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel_timer(&self) {
        if let Some(key) = self.timer.get() {
            self.waker.cancel_timer(*key);
        }
    }
}

#[derive(Default)]
struct CondCore {
    waiters: parking_lot::Mutex<VecDeque<Arc<CondWaiter>>>,
}

/// Timer entry of a timed wait.
struct CondTimeout {
    core: Arc<CondCore>,
    waiter: Arc<CondWaiter>,
}

impl TimerTarget for CondTimeout {
    fn fire(&self) {
        if !self.waiter.try_claim(CLAIMED_BY_TIMEOUT) {
            return;
        }
        {
            let mut waiters = self.core.waiters.lock();
            if let Some(pos) = waiters.iter().position(|w| Arc::ptr_eq(w, &self.waiter)) {
                waiters.remove(pos);
            }
        }
        #[cfg(feature = "metrics")]
        crate::metrics::record!(self.waiter.waker.runtime(), cond_timeouts);
        self.waiter.waker.wake();
    }
}

/// A condition variable for fibers.
///
/// Waiting parks the calling fiber and must happen inside a fiber; notifying
/// works from fibers and from plain threads.
pub struct Condvar {
    core: Arc<CondCore>,
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    /// Creates a condition variable with no waiters.
    pub fn new() -> Self {
        Self {
            core: Arc::new(CondCore::default()),
        }
    }

    /// Releases the guard's mutex, waits for a notification, and re-acquires
    /// the mutex before returning.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a fiber.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        let token = guard.token();
        match self.block(guard, None) {
            CLAIMED_BY_NOTIFY => {
                mutex.raw().lock_as(token);
                MutexGuard::relocked(mutex, token)
            }
            claim => invariant_violation(format_args!(
                "untimed condition wait resumed with claim {claim}"
            )),
        }
    }

    /// Like [`wait`](Condvar::wait), but gives up after `timeout`.
    ///
    /// On notification the mutex is re-acquired and the guard returned. On
    /// timeout the mutex is **not** held; the caller has to lock it again
    /// before looking at shared state.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a fiber.
    pub fn wait_for<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> Result<MutexGuard<'a, T>, TimedOut> {
        let mutex = guard.mutex();
        let token = guard.token();
        // A deadline past the clock's range never fires.
        let deadline = Instant::now().checked_add(timeout);
        match self.block(guard, deadline) {
            CLAIMED_BY_NOTIFY => {
                mutex.raw().lock_as(token);
                Ok(MutexGuard::relocked(mutex, token))
            }
            CLAIMED_BY_TIMEOUT => Err(TimedOut),
            claim => invariant_violation(format_args!(
                "timed condition wait resumed with claim {claim}"
            )),
        }
    }

    /// Waits until `condition` returns false, re-checking after every wake-up.
    pub fn wait_while<'a, T, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        T: ?Sized,
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Parks the calling fiber on this condition and returns how it was claimed.
    fn block<T: ?Sized>(&self, guard: MutexGuard<'_, T>, deadline: Option<Instant>) -> u8 {
        assert!(fiber::in_fiber(), "Condvar::wait called outside of a fiber");
        let raw: &RawMutex = guard.mutex().raw();
        let token = guard.token();
        // The hook releases the mutex once the waiter is linked.
        std::mem::forget(guard);

        let waiter = Arc::new(CondWaiter {
            claim: AtomicU8::new(UNCLAIMED),
            waker: FiberWaker::current(),
            timer: OnceLock::new(),
        });
        let reason = if deadline.is_some() {
            BlockReason::CondWithTimer
        } else {
            BlockReason::Cond
        };

        let core = self.core.clone();
        let linked = waiter.clone();
        fiber::block_current(
            reason,
            Box::new(move || {
                let mut waiters = core.waiters.lock();
                waiters.push_back(linked.clone());
                raw.release(token);
                if let Some(deadline) = deadline {
                    let target = Arc::new(CondTimeout {
                        core: core.clone(),
                        waiter: linked.clone(),
                    });
                    let key = linked.waker.register_timer(deadline, target);
                    let _ = linked.timer.set(key);
                }
                drop(waiters);
            }),
        );

        waiter.claim.load(Ordering::Acquire)
    }

    /// Wakes one waiting fiber. Returns false if nobody was waiting.
    pub fn notify_one(&self) -> bool {
        loop {
            let Some(waiter) = self.core.waiters.lock().pop_front() else {
                return false;
            };
            if waiter.try_claim(CLAIMED_BY_NOTIFY) {
                waiter.cancel_timer();
                waiter.waker.wake();
                return true;
            }
            // Lost to its timeout, which delivers the wake-up instead.
        }
    }

    /// Wakes every waiting fiber and returns how many were woken.
    pub fn notify_all(&self) -> usize {
        let drained: Vec<_> = self.core.waiters.lock().drain(..).collect();
        let mut wakers = Vec::with_capacity(drained.len());
        for waiter in drained {
            if waiter.try_claim(CLAIMED_BY_NOTIFY) {
                waiter.cancel_timer();
                wakers.push(waiter.waker.clone());
            }
        }
        let woken = wakers.len();
        FiberWaker::wake_all(wakers);
        woken
    }

    /// Number of fibers currently on the wait list.
    pub fn waiter_count(&self) -> usize {
        self.core.waiters.lock().len()
    }
}

impl Drop for Condvar {
    fn drop(&mut self) {
        if !self.core.waiters.lock().is_empty() {
            usage_error(format_args!(
                "condition variable destroyed while fibers are waiting on it"
            ));
        }
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}
