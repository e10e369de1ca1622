//! Single-producer/single-consumer byte channels over pooled memory.
//!
//! The writer leases room with [`Channel::alloc`], fills a [`WritableBuffer`] and publishes it with
//! [`WritableBuffer::commit`]. The reader waits with [`Channel::read`], inspects the returned
//! [`ReadableBuffer`] in place and reports progress with [`Channel::advance`]: bytes before the
//! consumed cursor are released, and the reader only waits for new data again once it has
//! examined everything.
//!
//! Each side ends the exchange with [`Channel::complete_writing`] or
//! [`Channel::complete_reading`], optionally carrying a [`CompletionError`] that the other side
//! observes. The segments are released once both sides are completed.
mod awaiter;
mod completion;

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use parking_lot::Mutex;
use thiserror::Error;

use self::awaiter::{ReadAwaiter, Registration};
pub use self::completion::CompletionError;
use crate::{
    buffers::{Cursor, CursorError, Pending, ReadableBuffer, WritableBuffer},
    pool::{MemoryPool, PoolError},
    sync::Signal,
};

/// Default pause threshold for the writer: backpressure is disabled.
pub const DEFAULT_PAUSE_WRITER_THRESHOLD: usize = 0;

/// Errors returned by channel operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChannelError {
    /// A [`WritableBuffer`] is already alive for this channel.
    #[error("A write is already in progress")]
    AlreadyProducing,
    /// A read result has not been advanced yet.
    #[error("A read is already in progress")]
    AlreadyConsuming,
    /// [`Channel::advance`] was called without a pending read.
    #[error("No read in progress")]
    NotConsuming,
    /// Two reads waited at the same time. The channel is unusable afterwards.
    #[error("Concurrent reads on a single-reader channel")]
    ConcurrentReads,
    /// Writing has already been completed.
    #[error("Writing has been completed")]
    WriterCompleted,
    /// Reading has already been completed.
    #[error("Reading has been completed")]
    ReaderCompleted,
    /// The writer completed with an error.
    #[error("The writer failed")]
    WriterFailed(#[source] CompletionError),
    /// The reader completed with an error.
    #[error("The reader failed")]
    ReaderFailed(#[source] CompletionError),
    /// A length goes beyond the memory available to the writer.
    #[error("Out of the writable range")]
    OutOfRange,
    /// The pool could not provide memory.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Invalid cursor arithmetic.
    #[error(transparent)]
    Cursor(#[from] CursorError),
}

/// The outcome of a read.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// All the bytes committed and not consumed yet.
    pub buffer: ReadableBuffer,
    /// `true` once the writer completed: no more bytes will come.
    pub is_completed: bool,
}

#[derive(Default)]
struct Completion {
    completed: bool,
    error: Option<CompletionError>,
}

impl Completion {
    fn set(&mut self, error: Option<CompletionError>) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        self.error = error;
        true
    }

    fn get(&self) -> Option<Option<CompletionError>> {
        self.completed.then(|| self.error.clone())
    }
}

/// State shared by both sides, only touched under the channel lock.
#[derive(Default)]
struct State {
    /// First unconsumed byte.
    head: Cursor,
    /// End of the committed bytes.
    tail: Cursor,
    unconsumed: usize,
    writer: Completion,
    reader: Completion,
}

impl State {
    fn check_writable(&self) -> Result<(), ChannelError> {
        if self.writer.completed {
            return Err(ChannelError::WriterCompleted);
        }
        match self.reader.get() {
            Some(Some(error)) => Err(ChannelError::ReaderFailed(error)),
            Some(None) => Err(ChannelError::ReaderCompleted),
            None => Ok(()),
        }
    }

    fn append(&mut self, pending: Pending) {
        let Pending { base, chain, written } = pending;
        let mut last = None;
        if let Some((base, end)) = base {
            base.set_end(end);
            last = Some(base);
        }
        if let Some((head, tail)) = chain {
            match self.tail.segment() {
                Some(current) => {
                    let linked = current.link(Arc::clone(&head));
                    debug_assert!(linked, "Channel tail segment already linked");
                }
                None => self.head = Cursor::new(Arc::clone(&head), head.start()),
            }
            last = Some(tail);
        }
        if let Some(last) = last {
            let end = last.end();
            self.tail = Cursor::new(last, end);
        }
        self.unconsumed += written;
    }

    fn dispose(&mut self) {
        self.head = Cursor::default();
        self.tail = Cursor::default();
        self.unconsumed = 0;
        tracing::debug!("Channel disposed");
    }
}

struct ChannelInner {
    pool: MemoryPool,
    pause_writer_threshold: usize,
    resume_writer_threshold: usize,
    state: Mutex<State>,
    producing: AtomicBool,
    consuming: AtomicBool,
    faulted: AtomicBool,
    awaiter: ReadAwaiter,
    /// Notified on advance and completion.
    changed: Signal,
}

/// A single-producer/single-consumer byte channel.
///
/// Cloning the handle does not create a new channel: all clones share the same state and the
/// single-producer/single-consumer rules apply across them.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Creates a channel leasing its memory from `pool`, without writer backpressure.
    pub fn new(pool: MemoryPool) -> Self {
        Self::builder(pool).build()
    }

    /// Returns a builder to configure the channel.
    pub fn builder(pool: MemoryPool) -> ChannelBuilder {
        ChannelBuilder {
            pool,
            pause_writer_threshold: DEFAULT_PAUSE_WRITER_THRESHOLD,
            resume_writer_threshold: None,
        }
    }

    pub(crate) fn pool(&self) -> &MemoryPool {
        &self.inner.pool
    }

    /// Returns the number of committed bytes not consumed yet.
    pub fn unconsumed(&self) -> usize {
        self.inner.state.lock().unconsumed
    }

    /// Starts producing and returns a buffer with at least `min_size` contiguous bytes available.
    ///
    /// The spare room of the last committed block is reused when it is large enough.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::AlreadyProducing`] if another [`WritableBuffer`] is alive.
    /// - [`ChannelError::WriterCompleted`], [`ChannelError::ReaderCompleted`] or
    ///   [`ChannelError::ReaderFailed`] if the channel is completed.
    /// - [`ChannelError::Pool`] if `min_size` exceeds the block size or the pool is exhausted.
    pub fn alloc(&self, min_size: usize) -> Result<WritableBuffer, ChannelError> {
        if self.inner.producing.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::AlreadyProducing);
        }
        let min_size = min_size.max(1);
        let base = {
            let state = self.inner.state.lock();
            if let Err(e) = state.check_writable() {
                drop(state);
                self.end_producing();
                return Err(e);
            }
            state.tail.segment().filter(|s| s.spare() >= min_size).cloned()
        };
        // Dropping the writer on failure ends producing.
        let mut writer = WritableBuffer::new(self.clone(), base);
        writer.ensure(min_size)?;
        Ok(writer)
    }

    /// Links the bytes of a writer to the committed chain and ends producing.
    pub(crate) fn publish(&self, pending: Pending) -> Result<(), ChannelError> {
        let written = pending.written;
        let result = {
            let mut state = self.inner.state.lock();
            state.check_writable().map(|()| {
                state.append(pending);
                if written > 0 {
                    self.inner.awaiter.complete();
                }
                state.unconsumed
            })
        };
        self.end_producing();
        let unconsumed = result?;
        tracing::trace!(written, unconsumed, "Committed");
        Ok(())
    }

    pub(crate) fn end_producing(&self) {
        self.inner.producing.store(false, Ordering::Release);
    }

    /// Waits until the reader caught up with the writer, if backpressure is enabled.
    pub(crate) async fn wait_writable(&self) {
        let inner = &self.inner;
        if inner.pause_writer_threshold == 0 {
            return;
        }
        if inner.state.lock().unconsumed < inner.pause_writer_threshold {
            return;
        }
        tracing::trace!(threshold = inner.pause_writer_threshold, "Writer paused");
        inner
            .changed
            .wait_until(|| {
                let state = inner.state.lock();
                (state.unconsumed <= inner.resume_writer_threshold || state.reader.completed).then_some(())
            })
            .await;
    }

    /// Waits for committed bytes or the completion of the writer.
    ///
    /// Only one read may wait at a time: a second waiting read faults the channel and both fail
    /// with [`ChannelError::ConcurrentReads`].
    pub fn read(&self) -> ReadFuture<'_> {
        ReadFuture {
            channel: self,
            registered: false,
        }
    }

    /// Returns the committed bytes if a read would complete right away, `Ok(None)` otherwise.
    ///
    /// # Errors
    ///
    /// Same as [`Channel::read`].
    pub fn try_read(&self) -> Result<Option<ReadResult>, ChannelError> {
        let inner = &self.inner;
        if inner.faulted.load(Ordering::Acquire) {
            return Err(ChannelError::ConcurrentReads);
        }
        if inner.consuming.load(Ordering::Acquire) {
            return Err(ChannelError::AlreadyConsuming);
        }
        if !inner.awaiter.is_completed() {
            return Ok(None);
        }
        self.take_read().map(Some)
    }

    fn take_read(&self) -> Result<ReadResult, ChannelError> {
        let inner = &self.inner;
        if inner.faulted.load(Ordering::Acquire) {
            return Err(ChannelError::ConcurrentReads);
        }
        if inner.consuming.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::AlreadyConsuming);
        }
        let state = inner.state.lock();
        let failure = match (state.reader.completed, &state.writer.error) {
            (true, _) => Some(ChannelError::ReaderCompleted),
            (false, Some(error)) => Some(ChannelError::WriterFailed(error.clone())),
            (false, None) => None,
        };
        if let Some(error) = failure {
            inner.consuming.store(false, Ordering::Release);
            return Err(error);
        }
        Ok(ReadResult {
            buffer: ReadableBuffer::from_parts(state.head.clone(), state.tail.clone(), state.unconsumed, false),
            is_completed: state.writer.completed,
        })
    }

    fn fault(&self) {
        self.inner.faulted.store(true, Ordering::Release);
        self.inner.awaiter.wake();
        tracing::warn!("Concurrent reads detected, the channel is faulted");
    }

    /// Ends the pending read.
    ///
    /// Bytes before `consumed` are released. The next read waits for new data only if `examined`
    /// is at the end of the last read. A null cursor stands for the start of the last read.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NotConsuming`] if no read is pending.
    /// - [`ChannelError::Cursor`] if the cursors are not ordered within the unconsumed bytes.
    pub fn advance(&self, consumed: &Cursor, examined: &Cursor) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if !inner.consuming.load(Ordering::Acquire) {
            return Err(ChannelError::NotConsuming);
        }
        let mut state = inner.state.lock();
        let head = state.head.clone();
        let consumed = if consumed.is_null() { &head } else { consumed };
        let examined = if examined.is_null() { consumed } else { examined };

        let released = Cursor::distance(&state.head, consumed)?;
        Cursor::distance(consumed, examined)?;
        let unexamined = Cursor::distance(examined, &state.tail)?;

        state.head = consumed.skip_exhausted();
        state.unconsumed -= released;
        if unexamined == 0 && !state.writer.completed {
            inner.awaiter.reset();
        }
        let unconsumed = state.unconsumed;
        inner.consuming.store(false, Ordering::Release);
        drop(state);

        inner.changed.notify();
        tracing::trace!(released, unconsumed, "Advanced");
        Ok(())
    }

    /// Consumes and examines everything up to `cursor`.
    ///
    /// # Errors
    ///
    /// Same as [`Channel::advance`].
    pub fn advance_to(&self, cursor: &Cursor) -> Result<(), ChannelError> {
        self.advance(cursor, cursor)
    }

    /// Completes the writing side. Only the first completion is recorded.
    ///
    /// A pending read wakes up: it returns the remaining bytes with `is_completed` set, or
    /// [`ChannelError::WriterFailed`] if `error` is set.
    pub fn complete_writing(&self, error: Option<CompletionError>) {
        let failed = error.is_some();
        {
            let mut state = self.inner.state.lock();
            if !state.writer.set(error) {
                return;
            }
            self.inner.awaiter.complete();
            if state.reader.completed {
                state.dispose();
            }
        }
        self.inner.changed.notify();
        tracing::debug!(failed, "Writer completed");
    }

    /// Completes the reading side. Only the first completion is recorded.
    ///
    /// Further commits fail with [`ChannelError::ReaderCompleted`] or
    /// [`ChannelError::ReaderFailed`], and a paused writer is released.
    pub fn complete_reading(&self, error: Option<CompletionError>) {
        let failed = error.is_some();
        {
            let mut state = self.inner.state.lock();
            if !state.reader.set(error) {
                return;
            }
            self.inner.consuming.store(false, Ordering::Release);
            self.inner.awaiter.complete();
            if state.writer.completed {
                state.dispose();
            }
        }
        self.inner.changed.notify();
        tracing::debug!(failed, "Reader completed");
    }

    /// Waits for the writer to complete and returns its error, if any.
    pub async fn writer_completion(&self) -> Option<CompletionError> {
        let inner = &self.inner;
        inner.changed.wait_until(|| inner.state.lock().writer.get()).await
    }

    /// Waits for the reader to complete and returns its error, if any.
    pub async fn reader_completion(&self) -> Option<CompletionError> {
        let inner = &self.inner;
        inner.changed.wait_until(|| inner.state.lock().reader.get()).await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Channel")
            .field("unconsumed", &state.unconsumed)
            .field("writer_completed", &state.writer.completed)
            .field("reader_completed", &state.reader.completed)
            .field("producing", &self.inner.producing.load(Ordering::Relaxed))
            .field("consuming", &self.inner.consuming.load(Ordering::Relaxed))
            .finish()
    }
}

/// Future returned by [`Channel::read`].
#[must_use = "futures do nothing unless polled"]
pub struct ReadFuture<'a> {
    channel: &'a Channel,
    registered: bool,
}

impl ReadFuture<'_> {
    fn fail(&mut self, error: ChannelError) -> Poll<Result<ReadResult, ChannelError>> {
        if std::mem::take(&mut self.registered) {
            self.channel.inner.awaiter.unregister();
        }
        Poll::Ready(Err(error))
    }
}

impl Future for ReadFuture<'_> {
    type Output = Result<ReadResult, ChannelError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let channel = this.channel;
        let inner = &channel.inner;
        if inner.faulted.load(Ordering::Acquire) {
            return this.fail(ChannelError::ConcurrentReads);
        }

        if this.registered {
            if inner.awaiter.refresh(cx.waker()) {
                return Poll::Pending;
            }
            this.registered = false;
            return Poll::Ready(channel.take_read());
        }

        if inner.consuming.load(Ordering::Acquire) {
            return Poll::Ready(Err(ChannelError::AlreadyConsuming));
        }
        match inner.awaiter.register(cx.waker()) {
            Registration::Completed => Poll::Ready(channel.take_read()),
            Registration::Waiting => {
                this.registered = true;
                // A fault raised before the registration would not wake this read.
                if inner.faulted.load(Ordering::Acquire) {
                    return this.fail(ChannelError::ConcurrentReads);
                }
                Poll::Pending
            }
            Registration::Busy => {
                channel.fault();
                Poll::Ready(Err(ChannelError::ConcurrentReads))
            }
        }
    }
}

impl Drop for ReadFuture<'_> {
    fn drop(&mut self) {
        if self.registered {
            self.channel.inner.awaiter.unregister();
        }
    }
}

impl fmt::Debug for ReadFuture<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadFuture").field("registered", &self.registered).finish()
    }
}

/// Builder for configuring and creating a [`Channel`].
#[derive(Debug)]
pub struct ChannelBuilder {
    pool: MemoryPool,
    pause_writer_threshold: usize,
    resume_writer_threshold: Option<usize>,
}

impl ChannelBuilder {
    /// Sets the number of unconsumed bytes from which [`WritableBuffer::flush`] waits for the
    /// reader. `0` disables backpressure.
    pub fn pause_writer_threshold(mut self, threshold: usize) -> Self {
        self.pause_writer_threshold = threshold;
        self
    }

    /// Sets the number of unconsumed bytes at or below which a paused writer resumes.
    ///
    /// Defaults to half the pause threshold.
    pub fn resume_writer_threshold(mut self, threshold: usize) -> Self {
        self.resume_writer_threshold = Some(threshold);
        self
    }

    /// Creates the channel.
    ///
    /// # Panics
    ///
    /// Panics if the resume threshold is not below the pause threshold while backpressure is
    /// enabled.
    pub fn build(self) -> Channel {
        let pause = self.pause_writer_threshold;
        let resume = self.resume_writer_threshold.unwrap_or(pause / 2);
        assert!(
            pause == 0 || resume < pause,
            "Resume writer threshold ({resume}) must be lower than the pause threshold ({pause})"
        );
        Channel {
            inner: Arc::new(ChannelInner {
                pool: self.pool,
                pause_writer_threshold: pause,
                resume_writer_threshold: resume,
                state: Mutex::new(State::default()),
                producing: AtomicBool::new(false),
                consuming: AtomicBool::new(false),
                faulted: AtomicBool::new(false),
                awaiter: ReadAwaiter::new(),
                changed: Signal::new(),
            }),
        }
    }
}
