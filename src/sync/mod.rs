//! Fiber-aware synchronization primitives.
//!
//! Blocking operations here suspend the calling fiber and let its worker run
//! other fibers. Wake-ups go back through the scheduler's run queue.

pub mod condvar;
pub mod mutex;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard, RawMutex};

use crate::fiber::{self, BlockReason};
use crate::runtime::FiberWaker;
use crate::timer::TimerTarget;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stand-in deadline for durations the clock cannot represent (30 years).
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

struct SleepTarget(FiberWaker);

impl TimerTarget for SleepTarget {
    fn fire(&self) {
        self.0.wake();
    }
}

/// Suspends the calling fiber for at least `duration`.
///
/// Outside a fiber this sleeps the OS thread. A zero duration is a yield.
pub fn sleep(duration: Duration) {
    if !fiber::in_fiber() {
        std::thread::sleep(duration);
        return;
    }
    if duration.is_zero() {
        fiber::yield_now();
        return;
    }
    let now = Instant::now();
    let deadline = now
        .checked_add(duration)
        .unwrap_or_else(|| now + FAR_FUTURE);
    let waker = FiberWaker::current();
    fiber::block_current(
        BlockReason::Sleep,
        Box::new(move || {
            let target = Arc::new(SleepTarget(waker.clone()));
            waker.register_timer(deadline, target);
        }),
    );
}
