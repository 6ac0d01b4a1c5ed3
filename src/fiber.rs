//! Fiber management and execution context.
//!
//! A fiber is a stackful coroutine (`corosensei`) plus the bookkeeping the
//! scheduler needs to move it between the run queue, a worker and wait lists.
//! Fibers never switch to each other directly: every suspension returns
//! control to the worker that resumed the fiber, carrying a [`Suspend`] value
//! that tells the worker what to do next.

use crate::arena::ArenaIndex;
use crate::error::{Error, Result};
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Identifies a fiber within its scheduler.
///
/// Ids are generational: once a fiber finishes, its id never matches a later
/// fiber even if the storage slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    shard: u16,
    slot: ArenaIndex,
}

impl FiberId {
    pub(crate) fn new(shard: u16, slot: ArenaIndex) -> Self {
        Self { shard, slot }
    }

    pub(crate) fn shard(self) -> usize {
        self.shard as usize
    }

    pub(crate) fn slot(self) -> ArenaIndex {
        self.slot
    }

    /// Lock-ownership token. Unique among live fibers, distinct from recent
    /// occupants of the same slot, and disjoint from the tokens handed to
    /// plain OS threads (bit 63).
    pub(crate) fn owner_token(self) -> u64 {
        let generation = u64::from(self.slot.generation()) & 0xFF_FFFF;
        ((u64::from(self.shard) + 1) << 56) | (generation << 32) | u64::from(self.slot.index())
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({self})")
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}:{}",
            self.shard,
            self.slot.index(),
            self.slot.generation()
        )
    }
}

/// What a blocked fiber is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReason {
    /// Queued on a contended [`Mutex`](crate::sync::Mutex).
    Mutex,
    /// Waiting on a [`Condvar`](crate::sync::Condvar) without a deadline.
    Cond,
    /// Waiting on a condition variable and registered with the timer facility.
    CondWithTimer,
    /// Joining another fiber.
    Join,
    /// Sleeping until a timer fires.
    Sleep,
}

/// Lifecycle state of a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    /// In the run queue, waiting for a worker.
    Runnable,
    /// Executing on a worker thread.
    Running,
    /// Parked on a wait list or timer.
    Blocked(BlockReason),
    /// Finished; its storage has been released.
    Done,
}

/// Work the worker performs after the fiber has been switched out and checked
/// back into the fiber table. Registers the fiber wherever it is waiting.
pub(crate) type BlockHook = Box<dyn FnOnce() + Send + 'static>;

/// Value a fiber hands to its worker when it suspends.
pub(crate) enum Suspend {
    /// Cooperative yield: requeue me.
    Yield,
    /// Park me and run the hook once I'm fully switched out.
    Block(BlockReason, BlockHook),
}

/// Deferred end-of-fiber action: publishes the join result and wakes joiners.
pub(crate) trait Completion: Send {
    fn complete(self: Box<Self>);
}

/// What a single resume produced.
pub(crate) enum Outcome {
    Yielded,
    Blocked(BlockReason, BlockHook),
    Finished(Box<dyn Completion>),
    /// A panic escaped the fiber's own panic boundary.
    Panicked(Box<dyn std::any::Any + Send>),
}

type FiberYielder = Yielder<(), Suspend>;

/// A stackful execution context.
pub(crate) struct Fiber {
    coroutine: Coroutine<(), Suspend, Box<dyn Completion>, DefaultStack>,
    /// Set by the coroutine on first entry; lets any worker republish the
    /// yielder in its thread-local context before resuming.
    yielder: Arc<AtomicPtr<FiberYielder>>,
}

// SAFETY: a fiber is resumed by at most one worker at a time and the table
// hands it over under a lock. The entry closure is required to be Send.
unsafe impl Send for Fiber {}

#[derive(Clone, Copy)]
struct CurrentFiber {
    id: FiberId,
    yielder: *const FiberYielder,
}

thread_local! {
    static CURRENT_FIBER: Cell<Option<CurrentFiber>> = const { Cell::new(None) };
}

// Thread-local accessors stay out of line: a fiber may resume on a different
// thread, so the TLS address must be recomputed after every switch.
#[inline(never)]
fn load_current() -> Option<CurrentFiber> {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline(never)]
fn store_current(current: Option<CurrentFiber>) {
    CURRENT_FIBER.with(|c| c.set(current));
}

#[inline(never)]
fn publish_yielder(yielder: *const FiberYielder) {
    CURRENT_FIBER.with(|c| {
        if let Some(mut current) = c.get() {
            current.yielder = yielder;
            c.set(Some(current));
        }
    });
}

impl Fiber {
    /// Allocates a stack of `stack_size` bytes and prepares `entry` to run on it.
    pub(crate) fn new<F>(stack_size: usize, entry: F) -> Result<Self>
    where
        F: FnOnce() -> Box<dyn Completion> + Send + 'static,
    {
        let stack = DefaultStack::new(stack_size).map_err(|source| Error::StackAllocation {
            size: stack_size,
            source,
        })?;

        let yielder = Arc::new(AtomicPtr::new(std::ptr::null_mut()));
        let slot = yielder.clone();
        let coroutine = Coroutine::with_stack(stack, move |y: &FiberYielder, ()| {
            let ptr = y as *const FiberYielder;
            slot.store(ptr as *mut FiberYielder, Ordering::Release);
            publish_yielder(ptr);
            entry()
        });

        Ok(Fiber { coroutine, yielder })
    }

    /// Runs the fiber on the calling worker until it yields, blocks or finishes.
    pub(crate) fn resume(&mut self, id: FiberId) -> Outcome {
        store_current(Some(CurrentFiber {
            id,
            yielder: self.yielder.load(Ordering::Acquire),
        }));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.coroutine.resume(())
        }));

        store_current(None);

        match result {
            Ok(CoroutineResult::Yield(Suspend::Yield)) => Outcome::Yielded,
            Ok(CoroutineResult::Yield(Suspend::Block(reason, hook))) => {
                Outcome::Blocked(reason, hook)
            }
            Ok(CoroutineResult::Return(completion)) => Outcome::Finished(completion),
            Err(payload) => Outcome::Panicked(payload),
        }
    }
}

fn suspend(value: Suspend) {
    let current = load_current().expect("suspend called outside of a fiber");
    debug_assert!(!current.yielder.is_null(), "fiber yielder not initialized");
    // SAFETY: the yielder lives on this fiber's stack for as long as the fiber
    // runs, and CURRENT_FIBER only names the fiber executing on this thread.
    unsafe { (*current.yielder).suspend(value) };
}

/// Returns the id of the fiber running on this thread, if any.
pub fn current() -> Option<FiberId> {
    load_current().map(|c| c.id)
}

/// Returns true when called from inside a fiber.
pub fn in_fiber() -> bool {
    load_current().is_some()
}

/// Yields execution to allow other fibers to run.
///
/// Inside a fiber the fiber goes to the back of the run queue; on a plain
/// thread this yields the OS thread.
pub fn yield_now() {
    if in_fiber() {
        suspend(Suspend::Yield);
    } else {
        std::thread::yield_now();
    }
}

/// Parks the current fiber. `hook` runs on the worker after the switch and
/// must arrange for exactly one later wake-up.
///
/// The hook may borrow from the blocked fiber's stack. Once it has made the
/// fiber reachable by a waker it must not touch those borrows again, since
/// the fiber may already be running on another worker.
///
/// # Panics
///
/// Panics when called outside of a fiber.
pub(crate) fn block_current<'a>(reason: BlockReason, hook: Box<dyn FnOnce() + Send + 'a>) {
    assert!(in_fiber(), "blocking fiber operation called outside of a fiber");
    // SAFETY: the borrowed frame stays suspended until the hook publishes the
    // fiber to a waker, and the hook contract forbids later access.
    let hook: BlockHook = unsafe {
        std::mem::transmute::<Box<dyn FnOnce() + Send + 'a>, BlockHook>(hook)
    };
    suspend(Suspend::Block(reason, hook));
}
