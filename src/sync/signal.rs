use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use event_listener::Event;

/// Wakes up tasks waiting for a condition on shared state.
///
/// The condition lives outside the signal, usually behind the channel lock: whoever changes it
/// calls [`Signal::notify`], and waiters re-check it with the listen/re-check/await pattern so a
/// notification sent between the check and the await is never lost.
#[derive(Default)]
pub(crate) struct Signal {
    event: Event,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wakes up every waiter so they re-check their condition.
    #[inline]
    pub(crate) fn notify(&self) {
        self.event.notify(usize::MAX);
    }

    /// Waits until `check` returns `Some`.
    pub(crate) async fn wait_until<T, F>(&self, mut check: F) -> T
    where
        F: FnMut() -> Option<T>,
    {
        loop {
            // Check the condition.
            if let Some(value) = check() {
                return value;
            }

            // Register before re-checking so that a concurrent notify is not missed.
            let listener = self.event.listen();

            if let Some(value) = check() {
                return value;
            }

            listener.await;
        }
    }
}

/// Yields once to the scheduler.
#[derive(Debug, Default)]
pub(crate) struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
