use std::{
    sync::atomic::{AtomicU8, Ordering},
    task::Waker,
};

use futures::task::AtomicWaker;

/// No data nor completion to report: a read has to wait.
const NOT_COMPLETED: u8 = 0;
/// A read can complete right away.
const COMPLETED: u8 = 1;
/// A reader registered its waker and is suspended.
const WAITING: u8 = 2;

/// Outcome of [`ReadAwaiter::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    /// The awaiter completed meanwhile, the read can proceed.
    Completed,
    /// The waker is stored, the reader will be woken on completion.
    Waiting,
    /// Another reader is already waiting.
    Busy,
}

/// The single-waiter slot a reader suspends on.
///
/// The state moves `NotCompleted -> Waiting` when a reader registers, `* -> Completed` when the
/// writer commits or a side completes, and back to `NotCompleted` when the reader has examined
/// everything. Only one reader may be waiting at a time.
pub(crate) struct ReadAwaiter {
    state: AtomicU8,
    waker: AtomicWaker,
}

impl ReadAwaiter {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(NOT_COMPLETED),
            waker: AtomicWaker::new(),
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    /// Registers `waker` as the sole waiter, unless the awaiter is already completed.
    pub(crate) fn register(&self, waker: &Waker) -> Registration {
        match self
            .state
            .compare_exchange(NOT_COMPLETED, WAITING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // Only the winner of the slot touches the waker. A completion racing with the
                // registration is caught by the re-check.
                self.waker.register(waker);
                if self.is_completed() {
                    Registration::Completed
                } else {
                    Registration::Waiting
                }
            }
            Err(COMPLETED) => Registration::Completed,
            Err(_) => Registration::Busy,
        }
    }

    /// Refreshes the waker of the registered reader, returns `true` if it is still waiting.
    pub(crate) fn refresh(&self, waker: &Waker) -> bool {
        self.waker.register(waker);
        self.state.load(Ordering::Acquire) == WAITING
    }

    /// Gives up a registration, returns `false` if the awaiter completed meanwhile.
    pub(crate) fn unregister(&self) -> bool {
        self.state
            .compare_exchange(WAITING, NOT_COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Completes the awaiter and wakes the waiting reader, if any.
    ///
    /// The reader is only scheduled: it never runs on the caller's stack.
    pub(crate) fn complete(&self) {
        if self.state.swap(COMPLETED, Ordering::AcqRel) == WAITING {
            self.waker.wake();
        }
    }

    /// Moves back to `NotCompleted` so the next read waits for new data.
    pub(crate) fn reset(&self) {
        let _ = self
            .state
            .compare_exchange(COMPLETED, NOT_COMPLETED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Wakes the registered reader without completing, so it observes a fault.
    pub(crate) fn wake(&self) {
        self.waker.wake();
    }
}
