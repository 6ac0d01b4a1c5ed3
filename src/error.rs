//! Error types for the fiber runtime.
//!
//! Recoverable conditions (allocation failure, a fiber that panicked, a timed
//! out condition wait) are ordinary values. Misuse of the synchronization
//! primitives and a broken runtime invariant both abort the process.

use crate::fiber::FiberId;
use std::fmt;
use thiserror::Error;

/// Main error type for scheduler and fiber operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The stack for a new fiber could not be allocated.
    #[error("failed to allocate a {size}-byte fiber stack: {source}")]
    StackAllocation {
        /// Requested stack size in bytes.
        size: usize,
        /// Underlying allocation error.
        #[source]
        source: std::io::Error,
    },

    /// A worker thread could not be created.
    #[error("failed to spawn worker thread {index}: {source}")]
    ThreadSpawn {
        /// Index of the worker that failed to start.
        index: usize,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The scheduler configuration was rejected.
    #[error("invalid scheduler configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration is invalid.
        reason: String,
    },

    /// The joined fiber panicked instead of returning a value.
    #[error("fiber {id} panicked: {message}")]
    FiberPanicked {
        /// The fiber that panicked.
        id: FiberId,
        /// Panic payload rendered as text.
        message: String,
    },

    /// One or more worker threads panicked while the scheduler ran.
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),

    /// A fiber-level spawn was requested from a thread that is not a worker.
    #[error("no scheduler is running on this thread")]
    NoScheduler,
}

/// Convenient result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Returned by [`Condvar::wait_for`](crate::sync::Condvar::wait_for) when the
/// deadline elapsed before a notification arrived.
///
/// The mutex is *not* held when this is returned; re-lock it before touching
/// the protected state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("condition wait timed out")]
pub struct TimedOut;

/// Logs and aborts. Reserved for states that the runtime's own bookkeeping
/// makes unreachable, such as a fiber being woken twice.
#[cold]
#[inline(never)]
pub(crate) fn invariant_violation(what: fmt::Arguments<'_>) -> ! {
    tracing::error!("fiberlane internal invariant violated: {}", what);
    eprintln!("fiberlane internal invariant violated: {}", what);
    std::process::abort()
}

/// Logs and aborts. Reserved for misuse of a synchronization primitive, such
/// as unlocking a mutex the caller does not hold.
#[cold]
#[inline(never)]
pub(crate) fn usage_error(what: fmt::Arguments<'_>) -> ! {
    tracing::error!("fiberlane usage error: {}", what);
    eprintln!("fiberlane usage error: {}", what);
    std::process::abort()
}

/// Renders a panic payload the way the standard library does.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
