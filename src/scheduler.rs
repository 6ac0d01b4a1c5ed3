//! High-level scheduler interface.
//!
//! The [`Scheduler`] is the primary entry point for running fibers. It owns a
//! pool of worker threads and the shared run queue they drain, and provides
//! methods for spawning fibers and inspecting their progress.

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::fiber::{FiberId, FiberState};
use crate::join::JoinHandle;
use crate::runtime::Runtime;
use crate::worker::WorkerPool;
use std::sync::atomic::Ordering;

/// The main scheduler managing worker threads and fiber execution.
///
/// Fibers are cooperatively multiplexed onto the workers: a fiber runs until
/// it yields, blocks on a [`Mutex`](crate::Mutex) or [`Condvar`](crate::Condvar),
/// or returns.
///
/// Dropping the scheduler behaves like [`shutdown`](Scheduler::shutdown) but
/// discards worker panics after logging them.
pub struct Scheduler {
    pool: WorkerPool,
}

impl Scheduler {
    /// Creates a scheduler with the specified number of worker threads.
    ///
    /// # Example
    ///
    /// ```
    /// use fiberlane::Scheduler;
    ///
    /// let scheduler = Scheduler::new(4).unwrap();
    /// scheduler.shutdown().unwrap();
    /// ```
    pub fn new(num_workers: usize) -> Result<Self> {
        Self::with_config(SchedulerConfig::with_workers(num_workers))
    }

    /// Creates a scheduler with one worker per logical CPU.
    pub fn with_default_workers() -> Result<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Creates a scheduler with custom configuration.
    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            workers = config.num_workers,
            run_queue_capacity = config.run_queue_capacity,
            stack_size = config.stack_size,
            "starting scheduler"
        );
        Ok(Scheduler {
            pool: WorkerPool::start(config)?,
        })
    }

    fn runtime(&self) -> &std::sync::Arc<Runtime> {
        self.pool.runtime()
    }

    /// Spawns a fiber running `f` and returns a handle to join it.
    ///
    /// Fails with [`Error::StackAllocation`] if the fiber's stack cannot be
    /// allocated.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fiberlane::Scheduler;
    ///
    /// let scheduler = Scheduler::new(4).unwrap();
    /// let handle = scheduler.spawn(|| 6 * 7).unwrap();
    /// assert_eq!(handle.join().unwrap(), 42);
    /// ```
    pub fn spawn<F, T>(&self, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.runtime().spawn(f)
    }

    /// Spawns one fiber per closure and enqueues them with a single batch push.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fiberlane::Scheduler;
    ///
    /// let scheduler = Scheduler::new(4).unwrap();
    /// let handles = scheduler.spawn_batch((0..8).map(|i| move || i * 2)).unwrap();
    /// let sum: i32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    /// assert_eq!(sum, 56);
    /// ```
    pub fn spawn_batch<I, F, T>(&self, fs: I) -> Result<Vec<JoinHandle<T>>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.runtime().spawn_batch(fs)
    }

    /// Returns the number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.runtime().config.num_workers
    }

    /// Returns the number of workers that are not parked.
    pub fn active_workers(&self) -> usize {
        self.runtime().active_workers.load(Ordering::SeqCst)
    }

    /// Number of spawned fibers that have not finished yet.
    pub fn live_fibers(&self) -> usize {
        self.runtime().table.live()
    }

    /// Approximate number of runnable fibers waiting for a worker.
    pub fn run_queue_len(&self) -> usize {
        self.runtime().run_queue.len()
    }

    /// Number of pending timeouts (timed condition waits and sleeps).
    pub fn pending_timers(&self) -> usize {
        self.runtime().timers.len()
    }

    /// Current state of a fiber. Finished or unknown fibers report `Done`.
    pub fn fiber_state(&self, id: FiberId) -> FiberState {
        self.runtime().table.state(id)
    }

    /// Performance counters collected since the scheduler started.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.runtime().metrics.snapshot()
    }

    /// Shuts the scheduler down, waiting for every live fiber to finish.
    ///
    /// Fibers may keep spawning and synchronizing while the scheduler drains.
    /// A fiber blocked forever keeps shutdown waiting.
    ///
    /// Returns [`Error::WorkerPanicked`] if any worker thread panicked.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if !self.pool.is_running() {
            return Ok(());
        }
        tracing::info!(live = self.live_fibers(), "shutting down scheduler");
        let result = self.pool.shutdown();
        tracing::info!("scheduler stopped");
        result
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::error!(error = %err, "scheduler shutdown failed");
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("num_workers", &self.num_workers())
            .field("live_fibers", &self.live_fibers())
            .finish_non_exhaustive()
    }
}

/// Spawns a fiber on the scheduler that runs the calling fiber.
///
/// Fails with [`Error::NoScheduler`] when called from a thread that is not a
/// scheduler worker.
pub fn spawn<F, T>(f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let runtime = Runtime::current().ok_or(Error::NoScheduler)?;
    runtime.spawn(f)
}
