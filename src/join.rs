//! Completion tracking for spawned fibers.
//!
//! Every spawned fiber owns a [`JoinState`]. When the fiber's entry function
//! returns (or panics), the worker publishes the result and wakes everyone
//! joining it: blocked fibers go back on the run queue, and OS threads are
//! released from a parking_lot condition variable.

use crate::error::{Error, Result, panic_message};
use crate::fiber::{self, BlockReason, Completion, FiberId};
use crate::runtime::FiberWaker;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;

struct JoinInner<T> {
    result: Option<thread::Result<T>>,
    finished: bool,
    fiber_waiters: Vec<FiberWaker>,
}

pub(crate) struct JoinState<T> {
    inner: Mutex<JoinInner<T>>,
    thread_waiters: Condvar,
}

impl<T> JoinState<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(JoinInner {
                result: None,
                finished: false,
                fiber_waiters: Vec::new(),
            }),
            thread_waiters: Condvar::new(),
        }
    }
}

/// Publishes a finished fiber's result.
pub(crate) struct JoinCompletion<T> {
    state: Arc<JoinState<T>>,
    result: thread::Result<T>,
}

impl<T> JoinCompletion<T> {
    pub(crate) fn new(state: Arc<JoinState<T>>, result: thread::Result<T>) -> Self {
        Self { state, result }
    }
}

impl<T: Send> Completion for JoinCompletion<T> {
    fn complete(self: Box<Self>) {
        let JoinCompletion { state, result } = *self;
        let waiters = {
            let mut inner = state.inner.lock();
            inner.result = Some(result);
            inner.finished = true;
            std::mem::take(&mut inner.fiber_waiters)
        };
        state.thread_waiters.notify_all();
        FiberWaker::wake_all(waiters);
    }
}

/// An owned permission to wait for a fiber and take its result.
///
/// Dropping the handle detaches the fiber; it still runs to completion.
pub struct JoinHandle<T> {
    id: FiberId,
    state: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(id: FiberId, state: Arc<JoinState<T>>) -> Self {
        Self { id, state }
    }

    /// Id of the fiber this handle joins.
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Returns true once the fiber has finished.
    pub fn is_finished(&self) -> bool {
        self.state.inner.lock().finished
    }

    /// Waits for the fiber to finish and returns its value.
    ///
    /// From inside a fiber this blocks only the calling fiber; from an OS
    /// thread it blocks the thread. A panic inside the joined fiber is
    /// reported as [`Error::FiberPanicked`].
    pub fn join(self) -> Result<T>
    where
        T: Send + 'static,
    {
        if fiber::in_fiber() {
            self.wait_in_fiber();
        } else {
            let mut inner = self.state.inner.lock();
            while !inner.finished {
                self.state.thread_waiters.wait(&mut inner);
            }
        }

        let result = self.state.inner.lock().result.take();
        match result {
            Some(Ok(value)) => Ok(value),
            Some(Err(payload)) => Err(Error::FiberPanicked {
                id: self.id,
                message: panic_message(payload.as_ref()),
            }),
            None => unreachable!("join state finished without a result"),
        }
    }

    fn wait_in_fiber(&self)
    where
        T: Send + 'static,
    {
        if self.state.inner.lock().finished {
            return;
        }
        let waker = FiberWaker::current();
        let state = self.state.clone();
        fiber::block_current(
            BlockReason::Join,
            Box::new(move || {
                let mut inner = state.inner.lock();
                if inner.finished {
                    drop(inner);
                    waker.wake();
                } else {
                    inner.fiber_waiters.push(waker);
                }
            }),
        );
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
