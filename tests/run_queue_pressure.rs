//! Concurrent pressure on the run queue tiers: nothing lost, nothing duplicated.

use fiberlane::queue::{BoundedQueue, OVERFLOW_POLL_INTERVAL, RunQueue};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const PRODUCERS: usize = 4;
const CONSUMERS: usize = 4;
const PER_PRODUCER: usize = 20_000;

fn drain_and_check(seen: Vec<Vec<usize>>) {
    let mut all: Vec<usize> = seen.into_iter().flatten().collect();
    all.sort_unstable();
    assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
    for (expected, got) in all.iter().enumerate() {
        assert_eq!(*got, expected, "value lost or duplicated");
    }
}

#[test]
fn test_bounded_batch_push_and_pop_under_contention() {
    let queue = Arc::new(BoundedQueue::new(64));
    let barrier = Arc::new(Barrier::new(PRODUCERS + CONSUMERS));
    let produced = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            let produced = produced.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut pending: VecDeque<usize> =
                    (p * PER_PRODUCER..(p + 1) * PER_PRODUCER).collect();
                while !pending.is_empty() {
                    // Batches of varying size; whatever does not fit is retried.
                    let take = pending.len().min(1 + pending.len() % 7);
                    let mut batch: VecDeque<usize> = pending.drain(..take).collect();
                    let pushed = queue.push_batch(&mut batch);
                    produced.fetch_add(pushed, Ordering::SeqCst);
                    while let Some(v) = batch.pop_back() {
                        pending.push_front(v);
                    }
                    if pushed == 0 {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            let produced = produced.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut seen = Vec::new();
                let mut batch = VecDeque::new();
                loop {
                    if queue.pop_batch(&mut batch, 8) > 0 {
                        seen.extend(batch.drain(..));
                    } else if produced.load(Ordering::SeqCst) == PRODUCERS * PER_PRODUCER
                        && queue.is_empty()
                    {
                        break;
                    } else {
                        thread::yield_now();
                    }
                }
                seen
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    drain_and_check(consumers.into_iter().map(|c| c.join().unwrap()).collect());
}

#[test]
fn test_run_queue_never_drops_under_overflow() {
    // Capacity far below the in-flight count keeps the overflow tier busy.
    let queue = Arc::new(RunQueue::new(8));
    let done = Arc::new(AtomicBool::new(false));
    let remaining = Arc::new(AtomicUsize::new(PRODUCERS));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            let remaining = remaining.clone();
            let done = done.clone();
            thread::spawn(move || {
                let base = p * PER_PRODUCER;
                let mut next = base;
                while next < base + PER_PRODUCER {
                    if next % 3 == 0 {
                        let end = (next + 16).min(base + PER_PRODUCER);
                        let mut batch: VecDeque<usize> = (next..end).collect();
                        let placed = queue.push_batch(&mut batch);
                        assert_eq!(placed.total(), end - next);
                        next = end;
                    } else {
                        queue.push(next);
                        next += 1;
                    }
                }
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    done.store(true, Ordering::SeqCst);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = queue.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                let mut tick = 0u32;
                loop {
                    tick = tick.wrapping_add(1);
                    match queue.pop(tick) {
                        Some(v) => seen.push(v),
                        None if done.load(Ordering::SeqCst) && queue.is_empty() => break,
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    drain_and_check(consumers.into_iter().map(|c| c.join().unwrap()).collect());
    assert!(queue.is_empty());
    assert_eq!(queue.overflow_len(), 0);
}

#[test]
fn test_overflow_wait_is_bounded_by_poll_interval() {
    let queue = RunQueue::new(4);
    for i in 0..4 {
        queue.push(i);
    }
    queue.push(999);
    assert_eq!(queue.overflow_len(), 1);

    // Refill the ring after every pop; the spilled item still comes out in time.
    let mut pops = 0;
    let mut next = 4;
    loop {
        pops += 1;
        let v = queue.pop(pops).unwrap();
        if v == 999 {
            break;
        }
        queue.push(next);
        next += 1;
        assert!(pops <= OVERFLOW_POLL_INTERVAL, "overflow item starved");
    }
}
