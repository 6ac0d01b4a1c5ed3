//! Optional scheduler counters, compiled in with the `metrics` feature.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Increments a counter on the runtime's [`Metrics`] when the feature is on;
/// expands to nothing otherwise.
macro_rules! record {
    ($runtime:expr, $field:ident) => {
        $crate::metrics::record!($runtime, $field, 1)
    };
    ($runtime:expr, $field:ident, $n:expr) => {{
        #[cfg(feature = "metrics")]
        {
            $runtime
                .metrics
                .$field
                .fetch_add($n as u64, std::sync::atomic::Ordering::Relaxed);
        }
    }};
}

pub(crate) use record;

/// Performance counters for one scheduler.
#[derive(Debug)]
pub struct Metrics {
    /// Fibers created through `spawn` or `spawn_batch`.
    pub fibers_spawned: AtomicU64,
    /// Fibers that ran to completion (including ones that panicked).
    pub fibers_completed: AtomicU64,
    /// Cooperative yields.
    pub yields: AtomicU64,
    /// Suspensions on a mutex, condition variable, join or sleep.
    pub blocks: AtomicU64,
    /// Pushes accepted by the lock-free ring.
    pub bounded_pushes: AtomicU64,
    /// Pushes that spilled into the overflow queue.
    pub overflow_pushes: AtomicU64,
    /// Timer entries that reached their deadline.
    pub timer_fires: AtomicU64,
    /// Condition waits that ended by timeout.
    pub cond_timeouts: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a zeroed metrics instance.
    pub fn new() -> Self {
        Self {
            fibers_spawned: AtomicU64::new(0),
            fibers_completed: AtomicU64::new(0),
            yields: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            bounded_pushes: AtomicU64::new(0),
            overflow_pushes: AtomicU64::new(0),
            timer_fires: AtomicU64::new(0),
            cond_timeouts: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fibers_spawned: self.fibers_spawned.load(Ordering::Relaxed),
            fibers_completed: self.fibers_completed.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            bounded_pushes: self.bounded_pushes.load(Ordering::Relaxed),
            overflow_pushes: self.overflow_pushes.load(Ordering::Relaxed),
            timer_fires: self.timer_fires.load(Ordering::Relaxed),
            cond_timeouts: self.cond_timeouts.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub fibers_spawned: u64,
    pub fibers_completed: u64,
    pub yields: u64,
    pub blocks: u64,
    pub bounded_pushes: u64,
    pub overflow_pushes: u64,
    pub timer_fires: u64,
    pub cond_timeouts: u64,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Completed fibers per second.
    pub fn fibers_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.fibers_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Share of run-queue pushes that missed the ring.
    pub fn overflow_ratio(&self) -> f64 {
        let total = self.bounded_pushes + self.overflow_pushes;
        if total == 0 {
            0.0
        } else {
            self.overflow_pushes as f64 / total as f64
        }
    }

    /// Fibers spawned but not yet completed at snapshot time.
    pub fn fibers_in_flight(&self) -> u64 {
        self.fibers_spawned.saturating_sub(self.fibers_completed)
    }
}
