//! Scheduler configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default capacity of the lock-free run queue.
pub const DEFAULT_RUN_QUEUE_CAPACITY: usize = 1024;
/// Default fiber stack size (256KB).
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
/// Smallest stack the scheduler accepts.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Configuration for a [`Scheduler`](crate::Scheduler).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads. Default: one per logical CPU.
    pub num_workers: usize,
    /// Capacity of the bounded run queue. Must be a power of two.
    /// Fibers beyond this spill into the overflow queue. Default: 1024.
    pub run_queue_capacity: usize,
    /// Stack size for each fiber in bytes. Default: 256KB.
    pub stack_size: usize,
    /// Empty polls of the run queue before an idle worker parks. Default: 64.
    pub idle_spins: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            run_queue_capacity: DEFAULT_RUN_QUEUE_CAPACITY,
            stack_size: DEFAULT_STACK_SIZE,
            idle_spins: 64,
        }
    }
}

impl SchedulerConfig {
    /// Default configuration with an explicit worker count.
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Self::default()
        }
    }

    /// Checks the configuration before any resources are allocated.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(invalid("num_workers must be at least 1"));
        }
        if self.run_queue_capacity < 2 || !self.run_queue_capacity.is_power_of_two() {
            return Err(invalid(format!(
                "run_queue_capacity must be a power of two >= 2, got {}",
                self.run_queue_capacity
            )));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(invalid(format!(
                "stack_size must be at least {} bytes, got {}",
                MIN_STACK_SIZE, self.stack_size
            )));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidConfig {
        reason: reason.into(),
    }
}
