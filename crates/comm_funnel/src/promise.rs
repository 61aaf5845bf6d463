// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{self, Waker};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::comm_thread;

/// Creates a write-once result channel: the [`Promise`] is fulfilled by whoever observes the
/// result and the [`CommFuture`] delivers it to whoever awaits it.
///
/// The two halves may live on any threads. Fulfilling consumes the promise, so a value can be
/// delivered at most once by construction.
///
/// # Disconnected promises
///
/// If the promise is dropped without being fulfilled, the future panics when polled. Under
/// normal operation every promise is fulfilled; a dropped promise means the communication
/// resource failed (e.g. a native call failed under [`NativeErrorAction::Panic`][1]) and the
/// awaiting task must not hang forever.
///
/// [1]: crate::NativeErrorAction::Panic
pub(crate) fn pair<T>() -> (Promise<T>, CommFuture<T>) {
    let cell = Arc::new(ResultCell {
        state: Mutex::new(CellState::Empty),
        written: Condvar::new(),
    });

    (Promise { cell: Arc::clone(&cell) }, CommFuture { cell })
}

#[derive(Debug)]
struct ResultCell<T> {
    state: Mutex<CellState<T>>,

    // Signaled whenever the cell becomes `Ready`, for threads blocked in `wait()`.
    written: Condvar,
}

impl<T> ResultCell<T> {
    #[cfg_attr(test, mutants::skip)] // Critical primitive - causes test timeouts if tampered.
    fn fulfill(&self, value: T) {
        let waker = {
            let mut state = self.state.lock();

            match mem::replace(&mut *state, CellState::Ready(Outcome::Fulfilled(value))) {
                CellState::Empty => None,
                CellState::Waiting(waker) => Some(waker),
                CellState::Ready(_) | CellState::Taken => {
                    unreachable!("the promise is consumed when fulfilled, so the cell is written at most once")
                }
            }
        };

        // Woken outside the lock so a receiver that resumes instantly does not contend with us.
        self.written.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn disconnect(&self) {
        let waker = {
            let mut state = self.state.lock();

            match &*state {
                CellState::Empty => {
                    *state = CellState::Ready(Outcome::Disconnected);
                    None
                }
                CellState::Waiting(_) => match mem::replace(&mut *state, CellState::Ready(Outcome::Disconnected)) {
                    CellState::Waiting(waker) => Some(waker),
                    _ => unreachable!("we are re-matching an already matched pattern"),
                },
                // Fulfilled before the promise was dropped.
                CellState::Ready(_) | CellState::Taken => None,
            }
        };

        self.written.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    #[cfg_attr(test, mutants::skip)] // Critical for code execution to occur in async contexts.
    fn poll(&self, waker: &Waker) -> Option<T> {
        let mut state = self.state.lock();

        if let CellState::Empty | CellState::Waiting(_) = &*state {
            // Only the waker from the most recent poll is woken, per the Future contract.
            *state = CellState::Waiting(waker.clone());
            return None;
        }

        Some(take(state))
    }

    /// Parks the current thread until the cell is written. Never enters an executor, so it may
    /// be called from inside a task of any runtime.
    #[cfg_attr(test, mutants::skip)] // Critical primitive - causes test timeouts if tampered.
    fn wait(&self) -> T {
        let mut state = self.state.lock();

        while let CellState::Empty | CellState::Waiting(_) = &*state {
            self.written.wait(&mut state);
        }

        take(state)
    }

    fn is_ready(&self) -> bool {
        matches!(&*self.state.lock(), CellState::Ready(_))
    }
}

/// Takes the value out of a written cell.
#[expect(clippy::panic, reason = "the Future contract permits panicking when polled after completion")]
fn take<T>(mut state: MutexGuard<'_, CellState<T>>) -> T {
    match mem::replace(&mut *state, CellState::Taken) {
        CellState::Ready(Outcome::Fulfilled(value)) => value,
        CellState::Ready(Outcome::Disconnected) => {
            drop(state);
            disconnected()
        }
        CellState::Empty | CellState::Waiting(_) => unreachable!("only a written cell is taken"),
        CellState::Taken => panic!("communication future polled after it already returned its result"),
    }
}

#[derive(Debug)]
enum CellState<T> {
    /// Nothing written and nobody waiting.
    Empty,

    /// Nothing written and a task is waiting to be woken.
    Waiting(Waker),

    /// Written but not yet taken by the future.
    Ready(Outcome<T>),

    /// The future has returned the value.
    Taken,
}

#[derive(Debug)]
enum Outcome<T> {
    Fulfilled(T),
    Disconnected,
}

#[expect(clippy::panic, reason = "a dropped promise means the communication resource failed")]
fn disconnected() -> ! {
    panic!("the communication resource dropped this operation without completing it")
}

/// The write side of a result channel. See [`pair()`].
pub(crate) struct Promise<T> {
    cell: Arc<ResultCell<T>>,
}

impl<T> Promise<T> {
    /// Delivers `value` to the paired [`CommFuture`], waking its task if one is waiting.
    #[cfg_attr(test, mutants::skip)] // Critical primitive - causes test timeouts if tampered.
    pub(crate) fn fulfill(self, value: T) {
        self.cell.fulfill(value);
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.cell.disconnect();
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

/// The result of an operation carried out on the dedicated communication resource.
///
/// Await it from any task to suspend that task until the operation completes, or call
/// [`wait()`][Self::wait] from a thread that is not running tasks.
///
/// # Panics
///
/// Polling panics if the communication resource abandoned the operation, which happens only
/// after a native call failed under [`NativeErrorAction::Panic`][crate::NativeErrorAction::Panic]
/// or after the subsystem was finalized.
pub struct CommFuture<T> {
    cell: Arc<ResultCell<T>>,
}

impl<T> CommFuture<T> {
    /// Blocks the current thread until the result is available.
    ///
    /// The thread is parked rather than driven as an executor, so this is also usable from
    /// synchronous code that happens to run inside an async task, such as a `Drop` impl.
    ///
    /// # Panics
    ///
    /// Panics if called on the dedicated communication thread, where it could never complete,
    /// and if the communication resource abandoned the operation.
    pub fn wait(self) -> T {
        comm_thread::assert_not_flagged("CommFuture::wait");

        self.cell.wait()
    }

    /// Whether the result is already available, so awaiting it will not suspend.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.cell.is_ready()
    }
}

impl<T> Future for CommFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        self.cell.poll(cx.waker()).map_or(task::Poll::Pending, task::Poll::Ready)
    }
}

impl<T> fmt::Debug for CommFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommFuture").field("is_ready", &self.is_ready()).finish()
    }
}
