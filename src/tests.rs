//! Integration tests for the fiber scheduler.

use crate::{Condvar, Mutex, Scheduler, SchedulerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[test]
fn test_basic_fiber_execution() {
    let scheduler = Scheduler::new(2).unwrap();
    let value = Arc::new(AtomicUsize::new(0));
    let value_clone = value.clone();

    let handle = scheduler
        .spawn(move || {
            value_clone.store(42, Ordering::SeqCst);
        })
        .unwrap();

    handle.join().unwrap();
    assert_eq!(value.load(Ordering::SeqCst), 42);
    scheduler.shutdown().expect("Shutdown failed");
}

#[test]
fn test_parallel_fiber_execution() {
    let scheduler = Scheduler::new(4).unwrap();
    let sum = Arc::new(AtomicUsize::new(0));

    let num_fibers = 100;
    let handles = scheduler
        .spawn_batch((0..num_fibers).map(|i| {
            let sum_clone = sum.clone();
            move || {
                sum_clone.fetch_add(i, Ordering::SeqCst);
            }
        }))
        .unwrap();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected_sum: usize = (0..num_fibers).sum();
    assert_eq!(sum.load(Ordering::SeqCst), expected_sum);
    scheduler.shutdown().expect("Shutdown failed");
}

#[test]
fn test_high_throughput_with_small_ring() {
    // A tiny ring forces most of the batch through the overflow queue.
    let config = SchedulerConfig {
        run_queue_capacity: 8,
        ..SchedulerConfig::with_workers(8)
    };
    let scheduler = Scheduler::with_config(config).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let num_fibers = 1000;

    let handles = scheduler
        .spawn_batch((0..num_fibers).map(|_| {
            let done = done.clone();
            move || {
                let mut sum = 0u64;
                for i in 0..100 {
                    sum += i;
                }
                done.fetch_add(1, Ordering::SeqCst);
                sum
            }
        }))
        .unwrap();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 4950);
    }
    assert_eq!(done.load(Ordering::SeqCst), num_fibers);
    scheduler.shutdown().expect("Shutdown failed");
}

#[test]
fn test_yield_interleaves_on_one_worker() {
    let scheduler = Scheduler::new(1).unwrap();
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));

    let handles = scheduler
        .spawn_batch([1, 2].map(|tag| {
            let log = log.clone();
            move || {
                for _ in 0..5 {
                    log.lock().unwrap().push(tag);
                    crate::yield_now();
                }
            }
        }))
        .unwrap();
    for handle in handles {
        handle.join().unwrap();
    }

    let final_log = log.lock().unwrap();
    assert_eq!(final_log.len(), 10);
    // One worker and a FIFO queue: the two fibers alternate strictly.
    assert_eq!(*final_log, vec![1, 2, 1, 2, 1, 2, 1, 2, 1, 2]);
    scheduler.shutdown().expect("Shutdown failed");
}

#[test]
fn test_blocked_fibers_do_not_block_workers() {
    // One worker: if a blocked fiber held the thread, the notifier never runs.
    let scheduler = Scheduler::new(1).unwrap();
    let pair = Arc::new((Mutex::new(false), Condvar::new()));

    let waiters = scheduler
        .spawn_batch((0..4).map(|_| {
            let pair = pair.clone();
            move || {
                let (ready, cond) = &*pair;
                let guard = cond.wait_while(ready.lock(), |ready| !*ready);
                assert!(*guard);
            }
        }))
        .unwrap();

    let notifier = {
        let pair = pair.clone();
        scheduler
            .spawn(move || {
                let (ready, cond) = &*pair;
                while cond.waiter_count() < 4 {
                    crate::sleep(Duration::from_millis(1));
                }
                *ready.lock() = true;
                cond.notify_all()
            })
            .unwrap()
    };

    assert_eq!(notifier.join().unwrap(), 4);
    for waiter in waiters {
        waiter.join().unwrap();
    }
    scheduler.shutdown().expect("Shutdown failed");
}

const ISOLATED_TEST: &str = "FIBERLANE_ISOLATED_TEST";

/// Runs `body` in a fresh copy of the unit-test binary and asserts that the
/// copy aborted with `message` on stderr. `test_path` is the full path of the
/// calling test, e.g. `sync::mutex::tests::test_name`.
pub(crate) fn expect_abort(test_path: &str, message: &str, body: impl FnOnce()) {
    if std::env::var(ISOLATED_TEST).as_deref() == Ok(test_path) {
        body();
        return;
    }

    let output = std::process::Command::new(std::env::current_exe().unwrap())
        .args([test_path, "--exact", "--nocapture", "--test-threads=1"])
        .env(ISOLATED_TEST, test_path)
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "child process for {test_path} kept running: {stderr}"
    );
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // SIGABRT
        assert_eq!(output.status.signal(), Some(6), "stderr: {stderr}");
    }
    assert!(stderr.contains(message), "stderr: {stderr}");
}
