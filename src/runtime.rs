//! State shared by a scheduler, its workers and every fiber it runs.
//!
//! Synchronization primitives never talk to the scheduler directly. They hold
//! [`FiberWaker`]s, and a waker knows which runtime its fiber belongs to, so a
//! wake-up can come from any thread (another worker, a timer pass, a plain OS
//! thread calling `notify_one`).

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::fiber::{self, Completion, Fiber, FiberId};
use crate::fiber_table::FiberTable;
use crate::join::{JoinCompletion, JoinHandle, JoinState};
use crate::metrics::record;
use crate::queue::{Placement, RunQueue};
use crate::timer::{TimerFacility, TimerKey, TimerTarget};
use crossbeam::sync::Unparker;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::time::Instant;

thread_local! {
    static RUNTIME: RefCell<Option<Arc<Runtime>>> = const { RefCell::new(None) };
}

/// Parked workers and the handles used to wake them.
struct IdleWorkers {
    unparkers: Vec<Unparker>,
    sleeping: Mutex<Vec<usize>>,
    num_sleeping: AtomicUsize,
}

impl IdleWorkers {
    fn new(unparkers: Vec<Unparker>) -> Self {
        Self {
            unparkers,
            sleeping: Mutex::new(Vec::new()),
            num_sleeping: AtomicUsize::new(0),
        }
    }

    fn prepare_park(&self, worker: usize) {
        self.sleeping.lock().push(worker);
        self.num_sleeping.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    fn cancel_park(&self, worker: usize) {
        let mut sleeping = self.sleeping.lock();
        if let Some(pos) = sleeping.iter().position(|&w| w == worker) {
            sleeping.swap_remove(pos);
            self.num_sleeping.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Wakes up to `n` parked workers.
    fn notify(&self, n: usize) {
        fence(Ordering::SeqCst);
        if n == 0 || self.num_sleeping.load(Ordering::SeqCst) == 0 {
            return;
        }
        let mut sleeping = self.sleeping.lock();
        for _ in 0..n {
            let Some(worker) = sleeping.pop() else { break };
            self.num_sleeping.fetch_sub(1, Ordering::SeqCst);
            self.unparkers[worker].unpark();
        }
    }

    fn notify_all(&self) {
        let mut sleeping = self.sleeping.lock();
        sleeping.clear();
        self.num_sleeping.store(0, Ordering::SeqCst);
        drop(sleeping);
        for unparker in &self.unparkers {
            unparker.unpark();
        }
    }
}

pub(crate) struct Runtime {
    pub(crate) config: SchedulerConfig,
    pub(crate) table: FiberTable,
    pub(crate) run_queue: RunQueue<FiberId>,
    pub(crate) timers: TimerFacility,
    idle: IdleWorkers,
    shutdown: AtomicBool,
    pub(crate) active_workers: AtomicUsize,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: crate::metrics::Metrics,
}

impl Runtime {
    pub(crate) fn new(config: SchedulerConfig, unparkers: Vec<Unparker>) -> Self {
        Self {
            table: FiberTable::new(config.num_workers),
            run_queue: RunQueue::new(config.run_queue_capacity),
            timers: TimerFacility::new(),
            idle: IdleWorkers::new(unparkers),
            shutdown: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            #[cfg(feature = "metrics")]
            metrics: crate::metrics::Metrics::new(),
            config,
        }
    }

    /// The runtime whose worker is executing on this thread.
    #[inline(never)]
    pub(crate) fn current() -> Option<Arc<Runtime>> {
        RUNTIME.with(|rt| rt.borrow().clone())
    }

    pub(crate) fn enter(runtime: Arc<Runtime>) {
        RUNTIME.with(|rt| *rt.borrow_mut() = Some(runtime));
    }

    pub(crate) fn exit() {
        RUNTIME.with(|rt| rt.borrow_mut().take());
    }

    pub(crate) fn spawn<F, T>(self: &Arc<Self>, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (id, handle) = self.create(f)?;
        self.enqueue(id);
        tracing::trace!(fiber = %id, "spawned fiber");
        Ok(handle)
    }

    pub(crate) fn spawn_batch<I, F, T>(self: &Arc<Self>, fs: I) -> Result<Vec<JoinHandle<T>>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut ids = VecDeque::new();
        let mut handles = Vec::new();
        for f in fs {
            match self.create(f) {
                Ok((id, handle)) => {
                    ids.push_back(id);
                    handles.push(handle);
                }
                Err(err) => {
                    // Fibers created so far still run; their handles are dropped.
                    self.enqueue_batch(ids);
                    return Err(err);
                }
            }
        }
        tracing::trace!(count = ids.len(), "spawned fiber batch");
        self.enqueue_batch(ids);
        Ok(handles)
    }

    fn create<F, T>(self: &Arc<Self>, f: F) -> Result<(FiberId, JoinHandle<T>)>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::new(JoinState::new());
        let completion = state.clone();
        let fiber = Fiber::new(self.config.stack_size, move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
            if let Err(payload) = &result {
                tracing::warn!(
                    fiber = ?fiber::current(),
                    "fiber panicked: {}",
                    crate::error::panic_message(payload.as_ref())
                );
            }
            Box::new(JoinCompletion::new(completion, result)) as Box<dyn Completion>
        })?;
        let id = self.table.insert(fiber);
        record!(self, fibers_spawned);
        Ok((id, JoinHandle::new(id, state)))
    }

    /// Pushes a runnable fiber and wakes a parked worker if one exists.
    pub(crate) fn enqueue(&self, id: FiberId) {
        match self.run_queue.push(id) {
            Placement::Bounded => record!(self, bounded_pushes),
            Placement::Overflow => {
                record!(self, overflow_pushes);
                tracing::trace!(fiber = %id, "run queue full, spilled to overflow");
            }
        }
        self.idle.notify(1);
    }

    pub(crate) fn enqueue_batch(&self, mut ids: VecDeque<FiberId>) {
        if ids.is_empty() {
            return;
        }
        let placed = self.run_queue.push_batch(&mut ids);
        record!(self, bounded_pushes, placed.bounded);
        record!(self, overflow_pushes, placed.overflow);
        if placed.overflow > 0 {
            tracing::trace!(
                bounded = placed.bounded,
                overflow = placed.overflow,
                "batch push spilled to overflow"
            );
        }
        self.idle.notify(placed.total());
    }

    /// Moves a blocked fiber back onto the run queue.
    pub(crate) fn wake(&self, id: FiberId) {
        self.table.mark_runnable(id);
        self.enqueue(id);
    }

    pub(crate) fn wake_batch(&self, ids: VecDeque<FiberId>) {
        for &id in &ids {
            self.table.mark_runnable(id);
        }
        self.enqueue_batch(ids);
    }

    /// Registers a timeout and shortens a parked worker's sleep if it became
    /// the earliest deadline.
    pub(crate) fn register_timer(&self, deadline: Instant, target: Arc<dyn TimerTarget>) -> TimerKey {
        let (key, earliest) = self.timers.register(deadline, target);
        if earliest {
            self.idle.notify(1);
        }
        key
    }

    pub(crate) fn poll_timers(&self) -> usize {
        let fired = self.timers.poll(Instant::now());
        record!(self, timer_fires, fired);
        fired
    }

    pub(crate) fn prepare_park(&self, worker: usize) {
        self.idle.prepare_park(worker);
    }

    pub(crate) fn cancel_park(&self, worker: usize) {
        self.idle.cancel_park(worker);
    }

    pub(crate) fn notify_all_workers(&self) {
        self.idle.notify_all();
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.idle.notify_all();
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Schedules one specific blocked fiber.
///
/// A waker is created by the fiber before it blocks and handed to whichever
/// wait list it joins. Delivering the same wake-up twice is a fatal error.
#[derive(Clone)]
pub(crate) struct FiberWaker {
    id: FiberId,
    runtime: Arc<Runtime>,
}

impl FiberWaker {
    /// Waker for the calling fiber.
    ///
    /// # Panics
    ///
    /// Panics outside of a fiber.
    pub(crate) fn current() -> Self {
        let id = fiber::current().expect("fiber waker requested outside of a fiber");
        let runtime = Runtime::current().expect("fiber is running without a scheduler");
        Self { id, runtime }
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    /// A waker for a made-up fiber on a runtime with no workers.
    #[cfg(test)]
    pub(crate) fn detached_for_test() -> Self {
        let mut arena = crate::arena::Arena::new();
        let id = FiberId::new(0, arena.insert(()));
        let runtime = Arc::new(Runtime::new(SchedulerConfig::with_workers(1), Vec::new()));
        Self { id, runtime }
    }

    pub(crate) fn wake(&self) {
        self.runtime.wake(self.id);
    }

    /// Registers `target` with the timers of this fiber's scheduler.
    pub(crate) fn register_timer(&self, deadline: Instant, target: Arc<dyn TimerTarget>) -> TimerKey {
        self.runtime.register_timer(deadline, target)
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) -> bool {
        self.runtime.timers.cancel(key)
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Wakes every fiber in `wakers`, one batch push per runtime.
    pub(crate) fn wake_all(wakers: Vec<FiberWaker>) {
        match wakers.len() {
            0 => {}
            1 => wakers[0].wake(),
            _ => {
                let mut groups: Vec<(Arc<Runtime>, VecDeque<FiberId>)> = Vec::new();
                for waker in wakers {
                    match groups
                        .iter_mut()
                        .find(|(rt, _)| Arc::ptr_eq(rt, &waker.runtime))
                    {
                        Some((_, ids)) => ids.push_back(waker.id),
                        None => groups.push((waker.runtime, VecDeque::from([waker.id]))),
                    }
                }
                for (runtime, ids) in groups {
                    runtime.wake_batch(ids);
                }
            }
        }
    }
}
