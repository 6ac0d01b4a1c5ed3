//! Notify and timeout racing for the same waiter.

use fiberlane::{Condvar, Mutex, Scheduler, TimedOut};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[test]
fn test_wait_for_times_out_without_holding_mutex() {
    let scheduler = Scheduler::new(2).unwrap();
    let handle = scheduler
        .spawn(|| {
            let mutex = Mutex::new(5u32);
            let cond = Condvar::new();
            let start = Instant::now();
            let result = cond.wait_for(mutex.lock(), Duration::from_millis(20));
            let elapsed = start.elapsed();

            assert!(matches!(result, Err(TimedOut)));
            assert!(elapsed >= Duration::from_millis(20));
            // Not held: re-locking must succeed right away.
            let guard = mutex.try_lock().expect("mutex still held after timeout");
            assert_eq!(*guard, 5);
            assert_eq!(cond.waiter_count(), 0);
        })
        .unwrap();
    handle.join().unwrap();
    scheduler.shutdown().unwrap();
}

#[test]
fn test_notify_before_deadline_returns_guard() {
    let scheduler = Scheduler::new(2).unwrap();
    let pair = Arc::new((Mutex::new(false), Condvar::new()));

    let waiter_pair = pair.clone();
    let waiter = scheduler
        .spawn(move || {
            let (ready, cond) = &*waiter_pair;
            let mut guard = ready.lock();
            while !*guard {
                guard = cond
                    .wait_for(guard, Duration::from_secs(30))
                    .expect("notification should beat a 30s timeout");
            }
            // Guard is held: mutating through it is fine.
            *guard = false;
        })
        .unwrap();

    let notifier_pair = pair.clone();
    scheduler
        .spawn(move || {
            let (ready, cond) = &*notifier_pair;
            while cond.waiter_count() == 0 {
                fiberlane::sleep(Duration::from_millis(1));
            }
            *ready.lock() = true;
            assert!(cond.notify_one());
        })
        .unwrap()
        .join()
        .unwrap();

    waiter.join().unwrap();
    assert!(!*pair.0.lock());
    scheduler.shutdown().unwrap();
}

#[test]
fn test_each_wait_is_claimed_exactly_once() {
    const WAITERS: usize = 8;
    const WAITS_PER_FIBER: usize = 300;

    let scheduler = Scheduler::new(4).unwrap();
    let shared = Arc::new((Mutex::new(()), Condvar::new()));
    let finished = Arc::new(AtomicUsize::new(0));

    let waiters = scheduler
        .spawn_batch((0..WAITERS).map(|seed| {
            let shared = shared.clone();
            let finished = finished.clone();
            move || {
                let (mutex, cond) = &*shared;
                let mut rng = SmallRng::seed_from_u64(seed as u64);
                let (mut notified, mut timed_out) = (0usize, 0usize);
                for _ in 0..WAITS_PER_FIBER {
                    let timeout = Duration::from_micros(rng.random_range(0..40));
                    match cond.wait_for(mutex.lock(), timeout) {
                        Ok(_guard) => notified += 1,
                        Err(TimedOut) => timed_out += 1,
                    }
                }
                finished.fetch_add(1, Ordering::SeqCst);
                assert_eq!(notified + timed_out, WAITS_PER_FIBER);
                notified
            }
        }))
        .unwrap();

    let notifier = {
        let shared = shared.clone();
        let finished = finished.clone();
        scheduler
            .spawn(move || {
                let (_, cond) = &*shared;
                let mut delivered = 0usize;
                let mut round = 0usize;
                while finished.load(Ordering::SeqCst) < WAITERS {
                    round += 1;
                    if round % 7 == 0 {
                        delivered += cond.notify_all();
                    } else if cond.notify_one() {
                        delivered += 1;
                    }
                    fiberlane::yield_now();
                }
                delivered
            })
            .unwrap()
    };

    let notified: usize = waiters.into_iter().map(|h| h.join().unwrap()).sum();
    let delivered = notifier.join().unwrap();
    // Every successful notify corresponds to exactly one waiter reporting Ok.
    assert_eq!(notified, delivered);
    assert_eq!(shared.1.waiter_count(), 0);
    scheduler.shutdown().unwrap();
}

#[test]
fn test_zero_timeout_still_yields_a_result() {
    let scheduler = Scheduler::new(1).unwrap();
    let handle = scheduler
        .spawn(|| {
            let mutex = Mutex::new(());
            let cond = Condvar::new();
            (0..100)
                .filter(|_| cond.wait_for(mutex.lock(), Duration::ZERO).is_err())
                .count()
        })
        .unwrap();
    assert_eq!(handle.join().unwrap(), 100);
    scheduler.shutdown().unwrap();
}

#[test]
fn test_wait_outside_fiber_panics() {
    let mutex = Mutex::new(());
    let cond = Condvar::new();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        drop(cond.wait(mutex.lock()));
    }));
    assert!(result.is_err());
    // The guard was released while unwinding.
    assert!(mutex.try_lock().is_some());
}
