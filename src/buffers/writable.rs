use std::{fmt, io, num::NonZeroUsize, sync::Arc};

use super::{
    ReadableBuffer,
    segment::{self, ChainBuilder, Segment},
    writer::{DidntWrite, Writer},
};
use crate::{
    channel::{Channel, ChannelError},
    sync::YieldNow,
};

/// Uncommitted data handed over to the channel on commit.
pub(crate) struct Pending {
    /// The reused channel tail and the position written up to in it.
    pub(crate) base: Option<(Arc<Segment>, usize)>,
    /// The private chain of segments leased by the writer.
    pub(crate) chain: Option<(Arc<Segment>, Arc<Segment>)>,
    pub(crate) written: usize,
}

/// The producing side of a [`Channel`].
///
/// Obtained with [`Channel::alloc`]. Bytes written here are invisible to the reader until
/// [`WritableBuffer::commit`] or [`WritableBuffer::flush`] publishes them. Dropping the buffer
/// without committing discards everything written through it.
///
/// The writer first fills the spare room of the channel tail segment, then leases new blocks from
/// the channel pool as needed. New segments stay private until commit, when they are linked to
/// the published chain in one step.
pub struct WritableBuffer {
    channel: Channel,
    base: Option<Arc<Segment>>,
    base_end: usize,
    head: Option<Arc<Segment>>,
    tail: Option<Arc<Segment>>,
    written: usize,
    peeked: bool,
    done: bool,
}

impl WritableBuffer {
    pub(crate) fn new(channel: Channel, base: Option<Arc<Segment>>) -> Self {
        let base_end = base.as_ref().map_or(0, |b| b.end());
        Self {
            channel,
            base,
            base_end,
            head: None,
            tail: None,
            written: 0,
            peeked: false,
            done: false,
        }
    }

    /// Returns the number of bytes written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Returns the number of contiguous bytes available in [`WritableBuffer::memory`].
    pub fn available(&self) -> usize {
        match (&self.tail, &self.base) {
            (Some(tail), _) => tail.spare(),
            (None, Some(base)) if base.spare() > 0 => base.capacity() - self.base_end,
            _ => 0,
        }
    }

    /// Makes sure at least `n` contiguous bytes are available, leasing a new block if needed.
    ///
    /// # Errors
    ///
    /// Fails with [`ChannelError::Pool`] if `n` is larger than the pool block size or a bounded
    /// pool is exhausted.
    pub fn ensure(&mut self, n: usize) -> Result<(), ChannelError> {
        if n == 0 || self.available() >= n {
            return Ok(());
        }
        let segment = Segment::new(self.channel.pool().lease(n)?);
        match &self.tail {
            Some(tail) => {
                let linked = tail.link(Arc::clone(&segment));
                debug_assert!(linked, "Private tail segment already linked");
            }
            None => self.head = Some(Arc::clone(&segment)),
        }
        self.tail = Some(segment);
        Ok(())
    }

    /// Returns the contiguous free memory of the current segment.
    ///
    /// The slice is empty until [`WritableBuffer::ensure`] (or a write) leased some room. Bytes
    /// written here become part of the buffer with [`WritableBuffer::advance`].
    pub fn memory(&mut self) -> &mut [u8] {
        let available = self.available();
        if available == 0 {
            return &mut [];
        }
        match (&self.tail, &self.base) {
            (Some(tail), _) => {
                let end = tail.end();
                // SAFETY: the private tail is owned by this writer and is not read-only since it
                // has spare room. The slice borrows `self` mutably, so no other slice aliases it.
                unsafe { tail.spare_mut(end..end + available) }
            }
            (None, Some(base)) => {
                let from = self.base_end;
                // SAFETY: this writer is the single producer of the channel and the range lies
                // past the published end of the tail segment.
                unsafe { base.spare_mut(from..from + available) }
            }
            (None, None) => &mut [],
        }
    }

    /// Marks `n` bytes of [`WritableBuffer::memory`] as written.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::OutOfRange`] if `n` exceeds the available memory.
    pub fn advance(&mut self, n: usize) -> Result<(), ChannelError> {
        if n > self.available() {
            return Err(ChannelError::OutOfRange);
        }
        match &self.tail {
            Some(tail) => tail.set_end(tail.end() + n),
            None => self.base_end += n,
        }
        self.written += n;
        Ok(())
    }

    /// Copies `bytes` into the buffer, spanning as many blocks as needed.
    ///
    /// # Errors
    ///
    /// Fails with [`ChannelError::Pool`] if the pool cannot provide more blocks. The bytes copied
    /// before the failure stay written.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        let mut rest = bytes;
        while !rest.is_empty() {
            self.ensure(1)?;
            let memory = self.memory();
            let n = memory.len().min(rest.len());
            memory[..n].copy_from_slice(&rest[..n]);
            self.advance(n)?;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Appends the bytes of `buffer` without copying them.
    ///
    /// The segments of `buffer` are cloned as read-only segments sharing the same blocks and are
    /// spliced after the bytes written so far. Further writes go to a new block.
    pub fn append(&mut self, buffer: &ReadableBuffer) {
        let Some((head, tail, len)) = segment::clone_range(buffer.start(), buffer.end()) else {
            return;
        };
        match &self.tail {
            Some(current) => {
                let linked = current.link(head);
                debug_assert!(linked, "Private tail segment already linked");
            }
            None => self.head = Some(head),
        }
        self.tail = Some(tail);
        self.written += len;
    }

    /// Returns a read-only view over the bytes written but not committed yet.
    ///
    /// The view shares the blocks and stays valid whatever happens to this writer.
    pub fn peek(&mut self) -> ReadableBuffer {
        let mut builder = ChainBuilder::default();
        if let Some(base) = &self.base {
            if self.base_end > base.end() {
                self.peeked = true;
            }
            builder.push(base, base.end()..self.base_end);
        }
        let mut current = self.head.as_ref();
        while let Some(segment) = current {
            builder.push(segment, segment.start()..segment.end());
            current = segment.next();
        }
        ReadableBuffer::from_chain(builder.finish())
    }

    fn take_pending(&mut self) -> Pending {
        self.done = true;
        let chain = match (self.head.take(), self.tail.take()) {
            (Some(head), Some(tail)) => Some((head, tail)),
            _ => None,
        };
        Pending {
            base: self.base.take().map(|base| (base, self.base_end)),
            chain,
            written: self.written,
        }
    }

    /// Publishes the written bytes to the reader and ends producing.
    ///
    /// A reader waiting on [`Channel::read`] is woken up, it runs on its own task.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::WriterCompleted`] if writing was completed meanwhile.
    /// - [`ChannelError::ReaderCompleted`] or [`ChannelError::ReaderFailed`] if the reader is gone,
    ///   in which case the bytes are dropped.
    pub fn commit(mut self) -> Result<(), ChannelError> {
        let pending = self.take_pending();
        self.channel.publish(pending)
    }

    /// Commits, then waits for the reader to catch up if the channel is over its pause threshold,
    /// then yields once to the scheduler.
    ///
    /// # Errors
    ///
    /// Same as [`WritableBuffer::commit`].
    pub async fn flush(self) -> Result<(), ChannelError> {
        let channel = self.channel.clone();
        self.commit()?;
        channel.wait_writable().await;
        YieldNow::default().await;
        Ok(())
    }
}

impl Drop for WritableBuffer {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let (true, Some(base)) = (self.peeked, &self.base) {
            // Peeked views still reference the discarded bytes past the published end.
            base.seal();
        }
        tracing::trace!(written = self.written, "Discarded an uncommitted write");
        self.channel.end_producing();
    }
}

impl Writer for WritableBuffer {
    fn write(&mut self, bytes: &[u8]) -> Result<NonZeroUsize, DidntWrite> {
        let len = NonZeroUsize::new(bytes.len()).ok_or(DidntWrite)?;
        WritableBuffer::write(self, bytes).map_err(|_| DidntWrite)?;
        Ok(len)
    }

    fn write_exact(&mut self, bytes: &[u8]) -> Result<(), DidntWrite> {
        WritableBuffer::write(self, bytes).map_err(|_| DidntWrite)
    }

    fn remaining(&self) -> usize {
        let pool = self.channel.pool();
        match pool.leasable_blocks() {
            Some(blocks) => blocks
                .saturating_mul(pool.block_size())
                .saturating_add(self.available()),
            None => usize::MAX,
        }
    }

    unsafe fn with_slot<F>(&mut self, len: usize, write: F) -> Result<NonZeroUsize, DidntWrite>
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        self.ensure(len).map_err(|_| DidntWrite)?;
        let written = write(&mut self.memory()[..len]);
        self.advance(written).map_err(|_| DidntWrite)?;
        NonZeroUsize::new(written).ok_or(DidntWrite)
    }
}

impl io::Write for WritableBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        WritableBuffer::write(self, buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for WritableBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableBuffer")
            .field("written", &self.written)
            .field("available", &self.available())
            .field("reuses_tail", &self.base.is_some())
            .finish()
    }
}
