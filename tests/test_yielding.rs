use fiberlane::Scheduler;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_cooperative_yielding() {
    let scheduler = Scheduler::new(2).unwrap();
    let iterations_completed = Arc::new(AtomicUsize::new(0));
    let other_fiber_ran = Arc::new(AtomicUsize::new(0));

    let iterations = iterations_completed.clone();
    let other = other_fiber_ran.clone();

    let long_handle = scheduler
        .spawn(move || {
            for i in 0..100 {
                iterations.fetch_add(1, Ordering::SeqCst);

                if i % 10 == 0 {
                    fiberlane::yield_now();
                }
            }
        })
        .unwrap();

    let short_handle = scheduler
        .spawn(move || {
            other.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    long_handle.join().unwrap();
    short_handle.join().unwrap();

    assert_eq!(iterations_completed.load(Ordering::SeqCst), 100);
    assert_eq!(other_fiber_ran.load(Ordering::SeqCst), 1);
    scheduler.shutdown().expect("Shutdown failed");
}

#[test]
fn test_yield_lets_single_worker_make_progress() {
    // The spinner only finishes once the flag setter has run on the same worker.
    let scheduler = Scheduler::new(1).unwrap();
    let flag = Arc::new(AtomicUsize::new(0));

    let spinner = {
        let flag = flag.clone();
        scheduler
            .spawn(move || {
                let mut yields = 0;
                while flag.load(Ordering::SeqCst) == 0 {
                    fiberlane::yield_now();
                    yields += 1;
                }
                yields
            })
            .unwrap()
    };
    let setter = {
        let flag = flag.clone();
        scheduler
            .spawn(move || flag.store(1, Ordering::SeqCst))
            .unwrap()
    };

    setter.join().unwrap();
    assert!(spinner.join().unwrap() >= 1);
    scheduler.shutdown().expect("Shutdown failed");
}

#[test]
fn test_yield_outside_fiber_is_harmless() {
    assert!(fiberlane::current().is_none());
    fiberlane::yield_now();
}
