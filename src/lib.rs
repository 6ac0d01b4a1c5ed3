//! # fiberlane - M:N Stackful Fiber Scheduler
//!
//! Many lightweight, stackful fibers are cooperatively multiplexed onto a
//! fixed pool of worker threads. Blocking on a fiber-aware [`Mutex`] or
//! [`Condvar`] suspends the fiber, not the worker thread, which immediately
//! moves on to the next runnable fiber.
//!
//! ## Architecture
//!
//! - **Run queue**: a lock-free bounded MPMC ring with batch push, backed by
//!   an overflow queue so pushes never fail ([`queue`])
//! - **Workers**: OS threads that pop fibers, resume them, and park when idle
//! - **Fibers**: `corosensei` coroutines with their own stacks
//! - **Sync primitives**: a FIFO hand-off mutex and a condition variable whose
//!   timed wait resolves the notify-vs-timeout race with one atomic claim
//! - **Timers**: deadline-ordered timeouts polled by the workers
//!
//! ## Example
//!
//! ```no_run
//! use fiberlane::{Condvar, Mutex, Scheduler};
//! use std::sync::Arc;
//!
//! let scheduler = Scheduler::new(4).unwrap();
//! let pair = Arc::new((Mutex::new(false), Condvar::new()));
//!
//! let waiter = {
//!     let pair = pair.clone();
//!     scheduler.spawn(move || {
//!         let (ready, cond) = &*pair;
//!         let guard = cond.wait_while(ready.lock(), |ready| !*ready);
//!         assert!(*guard);
//!     }).unwrap()
//! };
//!
//! scheduler.spawn(move || {
//!     let (ready, cond) = &*pair;
//!     *ready.lock() = true;
//!     cond.notify_one();
//! }).unwrap();
//!
//! waiter.join().unwrap();
//! scheduler.shutdown().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod fiber;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod sync;

mod arena;
mod fiber_table;
mod join;
mod runtime;
mod timer;
mod worker;

pub use config::SchedulerConfig;
pub use error::{Error, Result, TimedOut};
pub use fiber::{BlockReason, FiberId, FiberState, current, yield_now};
pub use join::JoinHandle;
pub use scheduler::{Scheduler, spawn};
pub use sync::{Condvar, Mutex, MutexGuard, RawMutex, sleep};

#[cfg(test)]
mod tests;
