use fiberlane::{Error, Mutex, Scheduler};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[test]
fn test_panic_is_reported_through_join() {
    let scheduler = Scheduler::new(1).unwrap();

    // Create a fiber that panics
    let handle = scheduler
        .spawn(|| -> u32 { panic!("Intentional panic for testing") })
        .unwrap();
    let id = handle.id();

    match handle.join() {
        Err(Error::FiberPanicked { id: panicked, message }) => {
            assert_eq!(panicked, id);
            assert_eq!(message, "Intentional panic for testing");
        }
        other => panic!("expected a panic report, got {other:?}"),
    }
    assert_eq!(scheduler.live_fibers(), 0);
    scheduler.shutdown().expect("a fiber panic must not take down a worker");
}

#[test]
fn test_worker_recovery_after_panic() {
    let scheduler = Scheduler::new(1).unwrap();

    // 1. Spawn panicking fiber
    let failed = scheduler.spawn(|| -> () { panic!("Boom") }).unwrap();
    assert!(failed.join().is_err());

    // 2. Spawn normal fiber to verify the worker is still alive
    let success = Arc::new(AtomicBool::new(false));
    let success_clone = success.clone();
    scheduler
        .spawn(move || success_clone.store(true, Ordering::SeqCst))
        .unwrap()
        .join()
        .unwrap();

    assert!(success.load(Ordering::SeqCst), "Subsequent fiber failed to run");
    scheduler.shutdown().unwrap();
}

#[test]
fn test_panic_while_holding_mutex_releases_it() {
    let scheduler = Scheduler::new(2).unwrap();
    let mutex = Arc::new(Mutex::new(0u32));

    let poisoner = mutex.clone();
    let failed = scheduler
        .spawn(move || -> () {
            let mut guard = poisoner.lock();
            *guard = 1;
            panic!("panic with the lock held");
        })
        .unwrap();
    assert!(failed.join().is_err());

    // The guard unlocked during unwinding; no poisoning.
    let reader = mutex.clone();
    let value = scheduler.spawn(move || *reader.lock()).unwrap().join().unwrap();
    assert_eq!(value, 1);
    scheduler.shutdown().unwrap();
}

#[test]
fn test_join_panicked_fiber_from_fiber() {
    let scheduler = Scheduler::new(2).unwrap();
    let outer = scheduler
        .spawn(|| {
            let inner = fiberlane::spawn(|| -> () { panic!("inner") }).unwrap();
            matches!(inner.join(), Err(Error::FiberPanicked { .. }))
        })
        .unwrap();
    assert!(outer.join().unwrap());
    scheduler.shutdown().unwrap();
}
