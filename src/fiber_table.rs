//! Storage for every live fiber of a scheduler.
//!
//! Fibers live in sharded generational arenas and everything else (run queue,
//! wait lists, timers) refers to them by [`FiberId`]. A worker checks a fiber
//! out before resuming it and checks it back in afterwards, so no shard lock
//! is ever held across a context switch.
//!
//! The table is also where wake-ups are validated: a fiber may only become
//! runnable from the `Blocked` state. Anything else means two parties believed
//! they owned the same wake-up, and the process aborts.

use crate::arena::Arena;
use crate::error::invariant_violation;
use crate::fiber::{Fiber, FiberId, FiberState};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_SHARDS: usize = 64;

struct FiberSlot {
    state: FiberState,
    /// `None` while the fiber is checked out by a worker.
    fiber: Option<Fiber>,
}

pub(crate) struct FiberTable {
    shards: Box<[CachePadded<Mutex<Arena<FiberSlot>>>]>,
    next_shard: AtomicUsize,
    live: AtomicUsize,
}

impl FiberTable {
    /// Creates a table with enough shards to keep `num_workers` workers from
    /// serializing on one lock.
    pub(crate) fn new(num_workers: usize) -> Self {
        let shard_count = (num_workers * 4).next_power_of_two().min(MAX_SHARDS);
        let shards = (0..shard_count)
            .map(|_| CachePadded::new(Mutex::new(Arena::new())))
            .collect();
        Self {
            shards,
            next_shard: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }
    }

    /// Stores a new fiber in the `Runnable` state and returns its id.
    pub(crate) fn insert(&self, fiber: Fiber) -> FiberId {
        let shard = self.next_shard.fetch_add(1, Ordering::Relaxed) & (self.shards.len() - 1);
        let slot = self.shards[shard].lock().insert(FiberSlot {
            state: FiberState::Runnable,
            fiber: Some(fiber),
        });
        self.live.fetch_add(1, Ordering::SeqCst);
        FiberId::new(shard as u16, slot)
    }

    /// Takes a runnable fiber out of the table for execution.
    pub(crate) fn checkout(&self, id: FiberId) -> Fiber {
        let mut shard = self.shards[id.shard()].lock();
        let Some(slot) = shard.get_mut(id.slot()) else {
            invariant_violation(format_args!("dispatched fiber {id} is not in the table"));
        };
        if slot.state != FiberState::Runnable {
            invariant_violation(format_args!(
                "dispatched fiber {id} in state {:?}",
                slot.state
            ));
        }
        match slot.fiber.take() {
            Some(fiber) => {
                slot.state = FiberState::Running;
                fiber
            }
            None => invariant_violation(format_args!("fiber {id} is already checked out")),
        }
    }

    /// Returns a suspended fiber to the table in `state`.
    pub(crate) fn checkin(&self, id: FiberId, fiber: Fiber, state: FiberState) {
        debug_assert!(matches!(
            state,
            FiberState::Runnable | FiberState::Blocked(_)
        ));
        let mut shard = self.shards[id.shard()].lock();
        let Some(slot) = shard.get_mut(id.slot()) else {
            invariant_violation(format_args!("suspended fiber {id} vanished from the table"));
        };
        slot.state = state;
        slot.fiber = Some(fiber);
    }

    /// Moves a blocked fiber to `Runnable`. The caller must enqueue it next.
    pub(crate) fn mark_runnable(&self, id: FiberId) {
        let mut shard = self.shards[id.shard()].lock();
        match shard.get_mut(id.slot()) {
            Some(slot) if matches!(slot.state, FiberState::Blocked(_)) => {
                slot.state = FiberState::Runnable;
            }
            Some(slot) => invariant_violation(format_args!(
                "wake-up delivered to fiber {id} in state {:?}",
                slot.state
            )),
            None => invariant_violation(format_args!("wake-up delivered to finished fiber {id}")),
        }
    }

    /// Drops the record of a finished fiber and returns how many fibers remain live.
    pub(crate) fn remove(&self, id: FiberId) -> usize {
        let removed = self.shards[id.shard()].lock().remove(id.slot());
        if removed.is_none() {
            invariant_violation(format_args!("finished fiber {id} was not in the table"));
        }
        self.live.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub(crate) fn state(&self, id: FiberId) -> FiberState {
        self.shards
            .get(id.shard())
            .and_then(|shard| shard.lock().get(id.slot()).map(|slot| slot.state))
            .unwrap_or(FiberState::Done)
    }

    /// Number of spawned fibers that have not finished.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}
