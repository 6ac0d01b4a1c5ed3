//! Fiber-aware mutual exclusion.
//!
//! An uncontended lock is a single compare-and-swap. A fiber that finds the
//! lock held is parked on a FIFO wait list instead of spinning, and `unlock`
//! hands ownership straight to the oldest waiter, so waiters acquire the lock
//! in the order they blocked.
//!
//! OS threads may use the same mutex. They never join the wait list; they spin
//! with backoff until the word is free, so they can be overtaken by fibers.

use crate::error::usage_error;
use crate::fiber::{self, BlockReason};
use crate::runtime::FiberWaker;
use crossbeam::utils::Backoff;
use std::cell::{Cell, UnsafeCell};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
/// Locked, and at least one fiber is (or is about to be) on the wait list.
const CONTENDED: u8 = 2;

const NO_OWNER: u64 = 0;
const THREAD_TOKEN_BIT: u64 = 1 << 63;

static NEXT_THREAD_SERIAL: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(NO_OWNER) };
}

/// Ownership token of the caller: its fiber id inside a fiber, a per-thread
/// serial otherwise.
pub(crate) fn current_owner_token() -> u64 {
    if let Some(id) = fiber::current() {
        return id.owner_token();
    }
    THREAD_TOKEN.with(|token| {
        if token.get() == NO_OWNER {
            let serial = NEXT_THREAD_SERIAL.fetch_add(1, Ordering::Relaxed);
            token.set(THREAD_TOKEN_BIT | serial);
        }
        token.get()
    })
}

/// A mutex without data, with explicit lock and unlock.
pub struct RawMutex {
    state: AtomicU8,
    owner: AtomicU64,
    waiters: parking_lot::Mutex<VecDeque<FiberWaker>>,
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RawMutex {
    /// Creates an unlocked mutex.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UNLOCKED),
            owner: AtomicU64::new(NO_OWNER),
            waiters: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Acquires the mutex, blocking the calling fiber (or spinning the calling
    /// thread) until it is available.
    pub fn lock(&self) {
        self.lock_as(current_owner_token());
    }

    /// Acquires the mutex only if it is free right now.
    pub fn try_lock(&self) -> bool {
        self.try_acquire(current_owner_token())
    }

    /// Releases the mutex.
    ///
    /// Aborts the process if the caller does not hold the lock.
    pub fn unlock(&self) {
        self.release(current_owner_token());
    }

    /// Returns true if some fiber or thread holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    pub(crate) fn lock_as(&self, token: u64) {
        if self.try_acquire(token) {
            return;
        }
        if fiber::in_fiber() {
            self.lock_fiber(token);
        } else {
            let backoff = Backoff::new();
            while !self.try_acquire(token) {
                backoff.snooze();
            }
        }
    }

    fn try_acquire(&self, token: u64) -> bool {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(token, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn lock_fiber(&self, token: u64) {
        let waker = FiberWaker::current();
        debug_assert_eq!(waker.id().owner_token(), token);
        fiber::block_current(
            BlockReason::Mutex,
            Box::new(move || {
                let mut waiters = self.waiters.lock();
                loop {
                    match self.state.load(Ordering::Relaxed) {
                        UNLOCKED => {
                            if self.try_acquire(token) {
                                drop(waiters);
                                waker.wake();
                                return;
                            }
                        }
                        LOCKED => {
                            if self
                                .state
                                .compare_exchange(
                                    LOCKED,
                                    CONTENDED,
                                    Ordering::Relaxed,
                                    Ordering::Relaxed,
                                )
                                .is_ok()
                            {
                                waiters.push_back(waker);
                                return;
                            }
                        }
                        _ => {
                            waiters.push_back(waker);
                            return;
                        }
                    }
                }
            }),
        );
        // Ownership was handed to us before the wake-up.
        debug_assert_eq!(self.owner.load(Ordering::Relaxed), token);
    }

    pub(crate) fn release(&self, token: u64) {
        let owner = self.owner.load(Ordering::Relaxed);
        if owner != token {
            usage_error(format_args!(
                "unlock of a fiber mutex that the caller does not hold"
            ));
        }
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        if self
            .state
            .compare_exchange(LOCKED, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        let mut waiters = self.waiters.lock();
        match waiters.pop_front() {
            Some(next) => {
                self.owner
                    .store(next.id().owner_token(), Ordering::Relaxed);
                let state = if waiters.is_empty() { LOCKED } else { CONTENDED };
                self.state.store(state, Ordering::Release);
                drop(waiters);
                next.wake();
            }
            None => self.state.store(UNLOCKED, Ordering::Release),
        }
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Drop for RawMutex {
    fn drop(&mut self) {
        if !self.waiters.get_mut().is_empty() {
            usage_error(format_args!(
                "fiber mutex destroyed while fibers are waiting on it"
            ));
        }
    }
}

impl fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// A mutual exclusion primitive protecting `T`, usable from fibers and threads.
///
/// Blocking in [`lock`](Mutex::lock) parks only the calling fiber; the worker
/// thread goes on to run other fibers.
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates an unlocked mutex holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the mutex and returns the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let token = current_owner_token();
        self.raw.lock_as(token);
        MutexGuard::new(self, token)
    }

    /// Acquires the mutex if it is free.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let token = current_owner_token();
        self.raw
            .try_acquire(token)
            .then(|| MutexGuard::new(self, token))
    }

    /// Mutable access without locking; the borrow checker proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub(crate) fn raw(&self) -> &RawMutex {
        &self.raw
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish_non_exhaustive()
    }
}

/// RAII guard; the lock is released when it is dropped.
///
/// The guard remembers which fiber or thread took the lock, so it stays valid
/// when its fiber migrates to another worker.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    token: u64,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>, token: u64) -> Self {
        Self {
            mutex,
            token,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    /// Rebuilds a guard for a lock the caller re-acquired with `token`.
    pub(crate) fn relocked(mutex: &'a Mutex<T>, token: u64) -> Self {
        Self::new(mutex, token)
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.release(self.token);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
