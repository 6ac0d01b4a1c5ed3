//! Run-queue building blocks.
//!
//! [`BoundedQueue`] is the lock-free hot path, [`OverflowQueue`] absorbs
//! bursts beyond its capacity, and [`RunQueue`] composes the two.

pub mod bounded;
pub mod overflow;
pub mod run_queue;

pub use bounded::BoundedQueue;
pub use overflow::OverflowQueue;
pub use run_queue::{BatchPlacement, Placement, RunQueue, OVERFLOW_POLL_INTERVAL};
