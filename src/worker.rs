//! Worker thread implementation.
//!
//! Worker threads pull runnable fibers from the shared run queue and resume
//! them until they yield, block or finish. They form the foundation of the
//! M:N threading model, where many fibers are multiplexed onto a fixed number
//! of worker threads.
//!
//! A worker never holds a lock while a fiber runs. Between dispatches it polls
//! the timer facility; when the queue stays empty it spins briefly and then
//! parks until a push, a new earliest timer, or shutdown wakes it. Once
//! shutdown begins a worker no longer parks: it keeps polling until every
//! fiber has finished.

use crate::config::SchedulerConfig;
use crate::error::{Error, Result, invariant_violation, panic_message};
use crate::fiber::{FiberId, FiberState, Outcome};
use crate::metrics::record;
use crate::runtime::Runtime;
use crossbeam::sync::Parker;
use crossbeam::utils::Backoff;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// What a worker is doing, for logging and park decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    /// Waiting for work.
    Idle,
    /// Resuming fibers.
    Dispatching,
    /// Shutdown requested; never parks, runs until no fiber is left.
    Draining,
}

/// A worker thread that executes fibers from the run queue.
pub(crate) struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Creates and starts a new worker thread.
    fn spawn(id: usize, runtime: Arc<Runtime>, parker: Parker) -> Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("fiberlane-worker-{id}"))
            .spawn(move || {
                Runtime::enter(runtime.clone());
                WorkerLoop {
                    id,
                    runtime,
                    parker,
                    state: WorkerState::Idle,
                }
                .run();
                Runtime::exit();
            })
            .map_err(|source| Error::ThreadSpawn { index: id, source })?;

        Ok(Worker {
            id,
            handle: Some(handle),
        })
    }

    /// Returns the worker's ID.
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Waits for the worker thread to finish.
    pub(crate) fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

struct WorkerLoop {
    id: usize,
    runtime: Arc<Runtime>,
    parker: Parker,
    state: WorkerState,
}

impl WorkerLoop {
    /// Main execution loop for the worker thread.
    fn run(&mut self) {
        let rt = self.runtime.clone();
        rt.active_workers.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(worker = self.id, "worker started");

        let mut tick: u32 = 0;
        let mut idle_polls: u32 = 0;
        let drain_backoff = Backoff::new();
        loop {
            rt.poll_timers();

            tick = tick.wrapping_add(1);
            if let Some(id) = rt.run_queue.pop(tick) {
                idle_polls = 0;
                drain_backoff.reset();
                if self.state == WorkerState::Idle {
                    self.state = WorkerState::Dispatching;
                }
                self.dispatch(id);
                continue;
            }

            if rt.is_shutting_down() {
                if rt.table.live() == 0 {
                    break;
                }
                if self.state != WorkerState::Draining {
                    tracing::debug!(
                        worker = self.id,
                        live = rt.table.live(),
                        "draining remaining fibers"
                    );
                    self.state = WorkerState::Draining;
                }
                // Draining workers stay awake to serve timers and wake-ups.
                drain_backoff.snooze();
                continue;
            }
            self.state = WorkerState::Idle;

            if idle_polls < rt.config.idle_spins {
                idle_polls += 1;
                std::hint::spin_loop();
                continue;
            }
            self.park();
            idle_polls = 0;
        }

        rt.active_workers.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(worker = self.id, "worker stopped");
    }

    fn park(&self) {
        let rt = &self.runtime;
        rt.prepare_park(self.id);

        // Re-check after announcing ourselves; a push or shutdown that raced
        // with the announcement has either been seen here or will unpark us.
        if !rt.run_queue.is_empty() || rt.is_shutting_down() {
            rt.cancel_park(self.id);
            return;
        }

        let timeout = rt
            .timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        rt.active_workers.fetch_sub(1, Ordering::SeqCst);
        match timeout {
            Some(timeout) => self.parker.park_timeout(timeout),
            None => self.parker.park(),
        }
        rt.active_workers.fetch_add(1, Ordering::SeqCst);
        rt.cancel_park(self.id);
    }

    /// Resumes one fiber and acts on how it suspended.
    fn dispatch(&self, id: FiberId) {
        let rt = &self.runtime;
        let mut fiber = rt.table.checkout(id);
        tracing::trace!(worker = self.id, fiber = %id, "resuming fiber");

        match fiber.resume(id) {
            Outcome::Yielded => {
                record!(rt, yields);
                rt.table.checkin(id, fiber, FiberState::Runnable);
                rt.enqueue(id);
            }
            Outcome::Blocked(reason, hook) => {
                record!(rt, blocks);
                rt.table.checkin(id, fiber, FiberState::Blocked(reason));
                hook();
            }
            Outcome::Finished(completion) => {
                drop(fiber);
                let remaining = rt.table.remove(id);
                completion.complete();
                record!(rt, fibers_completed);
                tracing::trace!(worker = self.id, fiber = %id, remaining, "fiber finished");
                if remaining == 0 && rt.is_shutting_down() {
                    rt.notify_all_workers();
                }
            }
            Outcome::Panicked(payload) => invariant_violation(format_args!(
                "fiber {id} unwound through its worker: {}",
                panic_message(payload.as_ref())
            )),
        }
    }
}

/// The worker threads of one scheduler.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    runtime: Arc<Runtime>,
}

impl WorkerPool {
    /// Builds the shared runtime and starts `config.num_workers` workers.
    ///
    /// If a thread fails to start, the workers already running are stopped
    /// before the error is returned.
    pub(crate) fn start(config: SchedulerConfig) -> Result<Self> {
        let num_workers = config.num_workers;
        let parkers: Vec<Parker> = (0..num_workers).map(|_| Parker::new()).collect();
        let unparkers = parkers.iter().map(|p| p.unparker().clone()).collect();
        let runtime = Arc::new(Runtime::new(config, unparkers));

        let mut pool = WorkerPool {
            workers: Vec::with_capacity(num_workers),
            runtime: runtime.clone(),
        };
        for (id, parker) in parkers.into_iter().enumerate() {
            match Worker::spawn(id, runtime.clone(), parker) {
                Ok(worker) => pool.workers.push(worker),
                Err(err) => {
                    // No fibers exist yet, so started workers exit at once.
                    let _ = pool.shutdown();
                    return Err(err);
                }
            }
        }
        Ok(pool)
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Returns the number of worker threads in the pool.
    #[cfg(test)]
    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Signals shutdown and waits for every worker to exit. Workers keep
    /// running until all live fibers have finished.
    ///
    /// Returns [`Error::WorkerPanicked`] with the number of workers that
    /// panicked.
    pub(crate) fn shutdown(&mut self) -> Result<()> {
        self.runtime.begin_shutdown();

        let mut failed_count = 0;
        for worker in self.workers.drain(..) {
            let worker_id = worker.id();
            if worker.join().is_err() {
                failed_count += 1;
                tracing::error!(worker = worker_id, "worker panicked during execution");
            }
        }

        if failed_count > 0 {
            Err(Error::WorkerPanicked(failed_count))
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_worker_pool_creation() {
        let mut pool = WorkerPool::start(SchedulerConfig::with_workers(4)).unwrap();
        assert_eq!(pool.size(), 4);
        assert!(pool.is_running());
        pool.shutdown().expect("Shutdown failed");
        assert!(!pool.is_running());
    }

    #[test]
    fn test_worker_pool_execution() {
        let mut pool = WorkerPool::start(SchedulerConfig::with_workers(2)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let num_fibers = 10;
        for _ in 0..num_fibers {
            let counter_clone = counter.clone();
            pool.runtime()
                .spawn(move || {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        // Shutdown drains every live fiber before the workers exit.
        pool.shutdown().expect("Shutdown failed");
        assert_eq!(counter.load(Ordering::SeqCst), num_fibers);
        assert_eq!(pool.runtime().table.live(), 0);
    }

    #[test]
    fn test_draining_workers_do_not_park() {
        let mut pool = WorkerPool::start(SchedulerConfig::with_workers(2)).unwrap();
        let runtime = pool.runtime().clone();
        pool.runtime()
            .spawn(|| crate::sleep(Duration::from_millis(300)))
            .unwrap();

        let observer = {
            let runtime = runtime.clone();
            thread::spawn(move || {
                while !runtime.is_shutting_down() {
                    thread::yield_now();
                }
                // Give every worker time to wake up from its idle park.
                thread::sleep(Duration::from_millis(50));
                let mut fewest_active = usize::MAX;
                loop {
                    let active = runtime.active_workers.load(Ordering::SeqCst);
                    // Workers only exit once nothing is live, so this sample
                    // predates any exit.
                    if runtime.table.live() == 0 {
                        break;
                    }
                    fewest_active = fewest_active.min(active);
                    thread::sleep(Duration::from_millis(5));
                }
                fewest_active
            })
        };

        let start = Instant::now();
        pool.shutdown().expect("Shutdown failed");
        let elapsed = start.elapsed();

        assert_eq!(observer.join().unwrap(), 2, "a draining worker parked");
        assert_eq!(runtime.table.live(), 0);
        assert!(elapsed < Duration::from_secs(5), "shutdown took {elapsed:?}");
    }

    #[test]
    fn test_idle_workers_park() {
        let mut pool = WorkerPool::start(SchedulerConfig::with_workers(2)).unwrap();
        let handle = pool.runtime().spawn(|| 42).unwrap();
        assert_eq!(handle.join().unwrap(), 42);

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.runtime().active_workers.load(Ordering::SeqCst) > 0 {
            assert!(Instant::now() < deadline, "workers never parked");
            thread::sleep(Duration::from_millis(1));
        }
        pool.shutdown().expect("Shutdown failed");
    }
}
