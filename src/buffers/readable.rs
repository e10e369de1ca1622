use std::{fmt, io, num::NonZeroUsize, sync::Arc};

use super::{
    cursor::{Cursor, CursorError, Spans},
    reader::{DidntRead, HasReader, Reader},
    segment::{self, Segment},
};

/// A read-only view over a range of bytes spread across one or more segments.
///
/// Slicing a buffer never copies: the result is another view over the same segments. The bytes
/// stay valid for as long as the view exists; [`ReadableBuffer::preserve`] additionally detaches
/// the view from the channel segments so the channel can recycle them on advance.
#[derive(Clone, Default)]
pub struct ReadableBuffer {
    start: Cursor,
    end: Cursor,
    len: usize,
    preserved: bool,
}

impl ReadableBuffer {
    /// Builds a view whose length is already known.
    pub(crate) fn from_parts(start: Cursor, end: Cursor, len: usize, preserved: bool) -> Self {
        debug_assert_eq!(Cursor::distance(&start, &end), Ok(len));
        Self {
            start,
            end,
            len,
            preserved,
        }
    }

    pub(crate) fn from_chain(chain: Option<(Arc<Segment>, Arc<Segment>, usize)>) -> Self {
        match chain {
            Some((head, tail, len)) => {
                let start = Cursor::new(Arc::clone(&head), head.start());
                let end = Cursor::new(Arc::clone(&tail), tail.end());
                Self::from_parts(start, end, len, true)
            }
            None => Self {
                preserved: true,
                ..Self::default()
            },
        }
    }

    /// Returns the number of bytes in the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer holds no byte.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if all the bytes are contiguous in memory.
    pub fn is_single_span(&self) -> bool {
        let mut spans = self.spans();
        spans.next();
        spans.next().is_none()
    }

    /// Returns `true` if the buffer owns its own segments (see [`ReadableBuffer::preserve`]).
    pub fn is_preserved(&self) -> bool {
        self.preserved
    }

    /// Cursor at the first byte.
    pub fn start(&self) -> &Cursor {
        &self.start
    }

    /// Cursor right after the last byte.
    pub fn end(&self) -> &Cursor {
        &self.end
    }

    /// Iterates over the contiguous spans of the buffer.
    pub fn spans(&self) -> Spans<'_> {
        Spans {
            inner: self.start.spans_to(&self.end),
        }
    }

    /// Returns the first contiguous span, empty if the buffer is empty.
    pub fn first_span(&self) -> &[u8] {
        self.spans().next().unwrap_or_default()
    }

    /// Returns the bytes from `offset` to the end.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::OutOfRange`] if `offset` is beyond the length.
    pub fn slice(&self, offset: usize) -> Result<ReadableBuffer, CursorError> {
        if offset > self.len {
            return Err(CursorError::OutOfRange);
        }
        let start = self.start.offset(offset, &self.end)?;
        Ok(self.derive(start, self.end.clone(), self.len - offset))
    }

    /// Returns `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::OutOfRange`] if the range is not within the buffer.
    pub fn slice_range(&self, offset: usize, len: usize) -> Result<ReadableBuffer, CursorError> {
        let last = offset.checked_add(len).ok_or(CursorError::OutOfRange)?;
        if last > self.len {
            return Err(CursorError::OutOfRange);
        }
        let start = self.start.offset(offset, &self.end)?;
        let end = start.offset(len, &self.end)?;
        Ok(self.derive(start, end, len))
    }

    /// Returns the bytes between two cursors of this buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::UnrelatedChains`] if the cursors are not in this buffer or are in
    /// reverse order.
    pub fn slice_between(&self, from: &Cursor, to: &Cursor) -> Result<ReadableBuffer, CursorError> {
        Cursor::distance(&self.start, from)?;
        let len = Cursor::distance(from, to)?;
        Cursor::distance(to, &self.end)?;
        Ok(self.derive(from.clone(), to.clone(), len))
    }

    /// Returns the bytes from `from` to the end of this buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::UnrelatedChains`] if the cursor is not in this buffer.
    pub fn slice_from(&self, from: &Cursor) -> Result<ReadableBuffer, CursorError> {
        let skipped = Cursor::distance(&self.start, from)?;
        if skipped > self.len {
            return Err(CursorError::UnrelatedChains);
        }
        Ok(self.derive(from.clone(), self.end.clone(), self.len - skipped))
    }

    /// Returns the bytes from the start of this buffer up to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::UnrelatedChains`] if the cursor is not in this buffer.
    pub fn slice_to(&self, to: &Cursor) -> Result<ReadableBuffer, CursorError> {
        let len = Cursor::distance(&self.start, to)?;
        if len > self.len {
            return Err(CursorError::UnrelatedChains);
        }
        Ok(self.derive(self.start.clone(), to.clone(), len))
    }

    /// The first `len` bytes, ending at `to`.
    pub(crate) fn prefix(&self, to: Cursor, len: usize) -> ReadableBuffer {
        self.derive(self.start.clone(), to, len)
    }

    fn derive(&self, start: Cursor, end: Cursor, len: usize) -> ReadableBuffer {
        Self::from_parts(start, end, len, self.preserved)
    }

    /// Copies the bytes into a chain of read-only segments owned by the returned buffer.
    ///
    /// The blocks are shared, not copied. The result stays valid after the channel this buffer
    /// was read from advances past it or is completed.
    pub fn preserve(&self) -> ReadableBuffer {
        Self::from_chain(segment::clone_range(&self.start, &self.end))
    }

    /// Copies as many bytes as fit into `into` and returns how many were copied.
    pub fn copy_to(&self, into: &mut [u8]) -> usize {
        let mut copied = 0;
        for span in self.spans() {
            let n = span.len().min(into.len() - copied);
            into[copied..copied + n].copy_from_slice(&span[..n]);
            copied += n;
            if copied == into.len() {
                break;
            }
        }
        copied
    }

    /// Copies the bytes into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(self.len);
        for span in self.spans() {
            vec.extend_from_slice(span);
        }
        vec
    }
}

impl PartialEq<[u8]> for ReadableBuffer {
    fn eq(&self, other: &[u8]) -> bool {
        if self.len != other.len() {
            return false;
        }
        let mut rest = other;
        self.spans().all(|span| {
            let (head, tail) = rest.split_at(span.len());
            rest = tail;
            head == span
        })
    }
}

impl PartialEq<&[u8]> for ReadableBuffer {
    fn eq(&self, other: &&[u8]) -> bool {
        self == *other
    }
}

impl<const N: usize> PartialEq<[u8; N]> for ReadableBuffer {
    fn eq(&self, other: &[u8; N]) -> bool {
        self == other.as_slice()
    }
}

impl<const N: usize> PartialEq<&[u8; N]> for ReadableBuffer {
    fn eq(&self, other: &&[u8; N]) -> bool {
        self == other.as_slice()
    }
}

impl fmt::Debug for ReadableBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX: usize = 32;
        let head = self.slice_range(0, self.len.min(MAX)).map(|b| b.to_vec()).unwrap_or_default();
        let mut s = f.debug_struct("ReadableBuffer");
        s.field("len", &self.len).field("preserved", &self.preserved);
        if self.len > MAX {
            s.field("bytes", &format_args!("{head:02x?}..."))
        } else {
            s.field("bytes", &format_args!("{head:02x?}"))
        };
        s.finish()
    }
}

/// A sequential reader over a [`ReadableBuffer`].
///
/// Obtained with [`ReadableBuffer::reader`]. Reading does not affect the buffer nor the channel
/// it comes from; use [`BufferReader::position`] to advance the channel afterwards.
#[derive(Debug, Clone)]
pub struct BufferReader {
    position: Cursor,
    end: Cursor,
    remaining: usize,
    preserved: bool,
}

impl BufferReader {
    /// Cursor at the next byte to be read.
    pub fn position(&self) -> &Cursor {
        &self.position
    }

    /// Returns the unread bytes as a buffer, without consuming them.
    pub fn as_buffer(&self) -> ReadableBuffer {
        ReadableBuffer::from_parts(self.position.clone(), self.end.clone(), self.remaining, self.preserved)
    }

    /// Reads exactly `len` bytes as a buffer sharing the underlying segments.
    ///
    /// # Errors
    ///
    /// Returns `DidntRead` if fewer than `len` bytes are left.
    pub fn read_buffer(&mut self, len: usize) -> Result<ReadableBuffer, DidntRead> {
        if len > self.remaining {
            return Err(DidntRead);
        }
        let end = self.position.offset(len, &self.end).map_err(|_| DidntRead)?;
        let start = std::mem::replace(&mut self.position, end.clone());
        self.remaining -= len;
        Ok(ReadableBuffer::from_parts(start, end, len, self.preserved))
    }

    /// Skips `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `DidntRead` if fewer than `len` bytes are left.
    pub fn skip(&mut self, len: usize) -> Result<(), DidntRead> {
        self.read_buffer(len).map(|_| ())
    }
}

impl Reader for BufferReader {
    fn read(&mut self, into: &mut [u8]) -> Result<NonZeroUsize, DidntRead> {
        let len = NonZeroUsize::new(into.len().min(self.remaining)).ok_or(DidntRead)?;
        let copied = self.read_buffer(len.get())?.copy_to(into);
        debug_assert_eq!(copied, len.get());
        Ok(len)
    }

    fn read_exact(&mut self, into: &mut [u8]) -> Result<(), DidntRead> {
        if into.len() > self.remaining {
            return Err(DidntRead);
        }
        self.read_buffer(into.len())?.copy_to(into);
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.remaining
    }
}

impl io::Read for BufferReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(Reader::read(self, buf).map_or(0, NonZeroUsize::get))
    }
}

impl HasReader for &ReadableBuffer {
    type Reader = BufferReader;

    fn reader(self) -> Self::Reader {
        BufferReader {
            position: self.start.clone(),
            end: self.end.clone(),
            remaining: self.len,
            preserved: self.preserved,
        }
    }
}

impl ReadableBuffer {
    /// Returns a sequential reader over the buffer.
    pub fn reader(&self) -> BufferReader {
        HasReader::reader(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel, MemoryPool};

    fn buffer(block_size: usize, bytes: &[u8]) -> (Channel, ReadableBuffer) {
        let pool = MemoryPool::builder().block_size(block_size).build();
        let channel = Channel::new(pool);
        let mut writer = channel.alloc(0).unwrap();
        writer.write(bytes).unwrap();
        writer.commit().unwrap();
        let buffer = channel.try_read().unwrap().unwrap().buffer;
        (channel, buffer)
    }

    #[test]
    fn readable_slices() {
        let (_channel, buf) = buffer(4, b"0123456789");
        assert_eq!(buf.len(), 10);
        assert!(!buf.is_single_span());
        assert_eq!(buf.first_span(), b"0123");

        // 1. Slices share the segments
        let tail = buf.slice(6).unwrap();
        assert_eq!(tail, b"6789");
        let mid = buf.slice_range(3, 4).unwrap();
        assert_eq!(mid, b"3456");
        assert_eq!(mid.spans().collect::<Vec<_>>(), [&b"3"[..], b"456"]);
        assert!(buf.slice(11).is_err());
        assert!(buf.slice_range(8, 3).is_err());

        // 2. Cursor based slicing
        let from = buf.start().offset(2, buf.end()).unwrap();
        let to = buf.start().offset(9, buf.end()).unwrap();
        assert_eq!(buf.slice_between(&from, &to).unwrap(), b"2345678");
        assert_eq!(buf.slice_from(&to).unwrap(), b"9");
        assert_eq!(buf.slice_to(&from).unwrap(), b"01");
        assert_eq!(buf.slice_between(&to, &from).unwrap_err(), CursorError::UnrelatedChains);

        // 3. Every offset agrees with the cursor arithmetic
        for i in 0..=buf.len() {
            let c = buf.start().offset(i, buf.end()).unwrap();
            assert_eq!(Cursor::distance(buf.start(), &c).unwrap(), i);
            assert_eq!(Cursor::distance(&c, buf.end()).unwrap(), buf.len() - i);
            assert_eq!(&c, buf.slice(i).unwrap().start());
        }
    }

    #[test]
    fn readable_preserve() {
        let (_channel, buf) = buffer(4, b"abcdefg");
        let kept = buf.preserve();
        assert!(kept.is_preserved());
        assert!(!buf.is_preserved());
        assert_eq!(kept, buf.to_vec().as_slice());
        assert_eq!(kept.spans().count(), 2);
        assert!(ReadableBuffer::default().preserve().is_empty());
    }

    #[test]
    fn readable_reader() {
        let (_channel, buf) = buffer(3, b"hello world");
        let mut reader = buf.reader();
        assert_eq!(reader.read_u8().unwrap(), b'h');

        let mut word = [0u8; 4];
        reader.read_exact(&mut word).unwrap();
        assert_eq!(&word, b"ello");
        reader.skip(1).unwrap();
        assert_eq!(reader.read_buffer(3).unwrap(), b"wor");
        assert_eq!(reader.as_buffer(), b"ld");

        let mut rest = Vec::new();
        io::Read::read_to_end(&mut reader, &mut rest).unwrap();
        assert_eq!(rest, b"ld");
        assert!(!reader.can_read());
        assert!(reader.read_u8().is_err());
        assert_eq!(reader.position(), buf.end());
        // The buffer itself is untouched
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn readable_debug() {
        let (_channel, buf) = buffer(8, &[0xab; 40]);
        let s = format!("{buf:?}");
        assert!(s.contains("len: 40"));
        assert!(s.contains("ab, ab"));
        assert!(s.contains("..."));
    }
}
