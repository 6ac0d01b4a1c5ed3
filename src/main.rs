use fiberlane::{Condvar, Mutex, Scheduler, SchedulerConfig};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

struct Turn {
    counter: u64,
    turn: u8,
}

struct Pair {
    state: Mutex<Turn>,
    cond: Condvar,
}

fn parse_arg<T: std::str::FromStr>(args: &[String], index: usize, name: &str, default: T) -> T {
    match args.get(index) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            eprintln!("invalid {name}: {raw}");
            std::process::exit(2);
        }),
        None => default,
    }
}

/// One side of a ping-pong pair. Waits for its turn, picking a plain or a
/// timed wait at random each time, then bumps the counter and hands the turn
/// over.
fn play(
    pair: &Pair,
    me: u8,
    iterations: u32,
    timeout: Duration,
    seed: u64,
    timeouts: &AtomicU64,
) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut local_timeouts = 0;
    for _ in 0..iterations {
        let mut guard = pair.state.lock();
        while guard.turn != me {
            if rng.random_bool(0.5) {
                guard = pair.cond.wait(guard);
            } else {
                match pair.cond.wait_for(guard, timeout) {
                    Ok(relocked) => guard = relocked,
                    Err(_) => {
                        local_timeouts += 1;
                        guard = pair.state.lock();
                    }
                }
            }
        }
        guard.counter += 1;
        guard.turn = 1 - me;
        drop(guard);
        pair.cond.notify_one();
    }
    timeouts.fetch_add(local_timeouts, Ordering::Relaxed);
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!(
            "Usage: {} [num_workers] [num_fibers] [num_iterations] [timeout_ns]",
            args[0]
        );
        return ExitCode::SUCCESS;
    }
    let num_workers = parse_arg(&args, 1, "num_workers", num_cpus::get());
    let num_fibers: u32 = parse_arg(&args, 2, "num_fibers", 64);
    let iterations: u32 = parse_arg(&args, 3, "num_iterations", 10_000);
    let timeout = Duration::from_nanos(parse_arg(&args, 4, "timeout_ns", 50_000));

    println!("fiberlane - condition variable ping-pong\n");
    let scheduler = match Scheduler::with_config(SchedulerConfig::with_workers(num_workers)) {
        Ok(scheduler) => scheduler,
        Err(err) => {
            eprintln!("Creating scheduler failed: {err}");
            return ExitCode::FAILURE;
        }
    };
    println!("Initialized scheduler with {num_workers} worker threads");

    // At least one pair.
    let num_pairs = num_fibers.div_ceil(2).max(1);
    let timeouts = Arc::new(AtomicU64::new(0));
    let pairs: Vec<Arc<Pair>> = (0..num_pairs)
        .map(|_| {
            Arc::new(Pair {
                state: Mutex::new(Turn {
                    counter: 0,
                    turn: 1,
                }),
                cond: Condvar::new(),
            })
        })
        .collect();

    let start = Instant::now();
    let mut handles = Vec::with_capacity(pairs.len() * 2);
    for (i, pair) in pairs.iter().enumerate() {
        for me in 0..2u8 {
            let pair = pair.clone();
            let timeouts = timeouts.clone();
            let seed = (i as u64) * 2 + u64::from(me);
            let spawned = scheduler
                .spawn(move || play(&pair, me, iterations, timeout, seed, &timeouts));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    eprintln!("Creating fiber failed: {err}");
                    return ExitCode::FAILURE;
                }
            }
        }
    }
    for handle in handles {
        if let Err(err) = handle.join() {
            eprintln!("Fiber failed: {err}");
            return ExitCode::FAILURE;
        }
    }
    let elapsed = start.elapsed();

    let expected = u64::from(iterations) * 2;
    for (i, pair) in pairs.iter().enumerate() {
        let state = pair.state.lock();
        if state.counter != expected || state.turn != 1 {
            eprintln!(
                "pair {i}: counter={} (expected {expected}), turn={}",
                state.counter, state.turn
            );
            return ExitCode::FAILURE;
        }
    }

    println!(
        "  {} pairs x {} round-trips in {:?}",
        num_pairs, iterations, elapsed
    );
    println!("  num_timeouts: {}", timeouts.load(Ordering::Relaxed));

    println!("\nShutting down scheduler...");
    match scheduler.shutdown() {
        Ok(()) => {
            println!("Done!");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Shutdown error: {err}");
            ExitCode::FAILURE
        }
    }
}
