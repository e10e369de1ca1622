use std::{fmt, sync::Arc};

use thiserror::Error;

use super::segment::Segment;

/// Errors returned by cursor arithmetic.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CursorError {
    /// The cursors do not belong to the same segment chain, or are in reverse order.
    #[error("Cursors do not belong to the same segment chain")]
    UnrelatedChains,
    /// The offset goes beyond the end of the range.
    #[error("Offset is out of the buffer range")]
    OutOfRange,
}

/// A position within a chain of segments.
///
/// A cursor points at byte `index` of a segment's block. It does not own any data by itself but
/// keeps the segment, and therefore the rest of the chain, alive.
///
/// The default cursor is not attached to any segment: it denotes an empty range or a search that
/// found nothing. Two cursors are equal when they point to the same index of the same segment;
/// the end of a segment and the start of the next one are different cursors for the same byte
/// position, and [`Cursor::distance`] between them is zero.
#[derive(Clone, Default)]
pub struct Cursor {
    segment: Option<Arc<Segment>>,
    index: usize,
}

impl Cursor {
    pub(crate) fn new(segment: Arc<Segment>, index: usize) -> Self {
        Self {
            segment: Some(segment),
            index,
        }
    }

    /// Returns `true` if the cursor is not attached to any segment.
    pub fn is_null(&self) -> bool {
        self.segment.is_none()
    }

    pub(crate) fn segment(&self) -> Option<&Arc<Segment>> {
        self.segment.as_ref()
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    fn is_in(&self, segment: &Arc<Segment>) -> bool {
        self.segment.as_ref().is_some_and(|s| Arc::ptr_eq(s, segment))
    }

    /// Upper bound of the readable bytes of `segment` when reading up to `end`.
    fn limit(segment: &Arc<Segment>, end: &Cursor) -> usize {
        if end.is_in(segment) { end.index } else { segment.end() }
    }

    /// Moves forward by up to `n` bytes without going past `end`.
    ///
    /// Returns the new cursor and the number of bytes actually moved, which is less than `n` when
    /// `end` is reached first. Landing exactly on the end of a segment leaves the cursor there.
    pub fn seek(&self, n: usize, end: &Cursor) -> (Cursor, usize) {
        let Some(mut segment) = self.segment.as_ref() else {
            return (self.clone(), 0);
        };
        let mut index = self.index;
        let mut remaining = n;
        loop {
            let limit = Self::limit(segment, end);
            let available = limit.saturating_sub(index);
            if remaining <= available {
                return (Cursor::new(Arc::clone(segment), index + remaining), n);
            }
            remaining -= available;
            let next = match segment.next() {
                Some(next) if !end.is_in(segment) => next,
                _ => return (Cursor::new(Arc::clone(segment), limit), n - remaining),
            };
            segment = next;
            index = segment.start();
        }
    }

    /// Moves forward by exactly `n` bytes without going past `end`.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::OutOfRange`] if fewer than `n` bytes lie before `end`.
    pub fn offset(&self, n: usize, end: &Cursor) -> Result<Cursor, CursorError> {
        if n == 0 {
            return Ok(self.clone());
        }
        match self.seek(n, end) {
            (cursor, moved) if moved == n => Ok(cursor),
            _ => Err(CursorError::OutOfRange),
        }
    }

    /// Returns the number of bytes between `from` and `to`.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::UnrelatedChains`] if `to` cannot be reached from `from` by walking
    /// the chain forward.
    pub fn distance(from: &Cursor, to: &Cursor) -> Result<usize, CursorError> {
        let (Some(mut segment), Some(target)) = (from.segment.as_ref(), to.segment.as_ref()) else {
            return match (from.is_null(), to.is_null()) {
                (true, true) => Ok(0),
                _ => Err(CursorError::UnrelatedChains),
            };
        };
        let mut index = from.index;
        let mut distance = 0;
        loop {
            if Arc::ptr_eq(segment, target) {
                return to
                    .index
                    .checked_sub(index)
                    .map(|d| distance + d)
                    .ok_or(CursorError::UnrelatedChains);
            }
            distance += segment.end().saturating_sub(index);
            segment = segment.next().ok_or(CursorError::UnrelatedChains)?;
            index = segment.start();
        }
    }

    /// Returns `true` if no byte lies between this cursor and `end`.
    pub fn is_end(&self, end: &Cursor) -> bool {
        let Some(mut segment) = self.segment.as_ref() else {
            return true;
        };
        let mut index = self.index;
        loop {
            if end.is_in(segment) {
                return index >= end.index;
            }
            if index < segment.end() {
                return false;
            }
            match segment.next() {
                Some(next) => {
                    segment = next;
                    index = segment.start();
                }
                None => return true,
            }
        }
    }

    /// Returns the longest contiguous run of bytes starting at this cursor and the cursor right
    /// after it, skipping empty segments. Returns `None` when `end` has been reached.
    pub fn try_get_span<'a>(&'a self, end: &'a Cursor) -> Option<(&'a [u8], Cursor)> {
        let span = self.spans_to(end).next()?;
        let after = Cursor::new(Arc::clone(span.segment), span.index + span.bytes.len());
        Some((span.bytes, after))
    }

    /// Moves past exhausted segments to the first one with data left, or to the last segment.
    pub(crate) fn skip_exhausted(&self) -> Cursor {
        let Some(mut segment) = self.segment.as_ref() else {
            return self.clone();
        };
        let mut index = self.index;
        while index >= segment.end() {
            match segment.next() {
                Some(next) => {
                    segment = next;
                    index = segment.start();
                }
                None => break,
            }
        }
        Cursor::new(Arc::clone(segment), index)
    }

    /// Iterates over the non-empty spans between this cursor and `end`.
    pub(crate) fn spans_to<'a>(&'a self, end: &'a Cursor) -> SegmentSpans<'a> {
        SegmentSpans {
            segment: self.segment.as_ref(),
            index: self.index,
            end,
        }
    }
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        let same = match (&self.segment, &other.segment) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same && self.index == other.index
    }
}

impl Eq for Cursor {}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.segment {
            Some(segment) => write!(f, "Cursor({:p}@{})", Arc::as_ptr(segment), self.index),
            None => f.write_str("Cursor(null)"),
        }
    }
}

/// A contiguous run of bytes inside a segment.
pub(crate) struct Span<'a> {
    pub(crate) segment: &'a Arc<Segment>,
    pub(crate) index: usize,
    pub(crate) bytes: &'a [u8],
}

impl Span<'_> {
    pub(crate) fn cursor_at(&self, offset: usize) -> Cursor {
        Cursor::new(Arc::clone(self.segment), self.index + offset)
    }
}

#[derive(Clone)]
pub(crate) struct SegmentSpans<'a> {
    segment: Option<&'a Arc<Segment>>,
    index: usize,
    end: &'a Cursor,
}

impl<'a> Iterator for SegmentSpans<'a> {
    type Item = Span<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let segment = self.segment?;
            let index = self.index;
            let limit = Cursor::limit(segment, self.end);
            self.segment = if self.end.is_in(segment) { None } else { segment.next() };
            if let Some(next) = self.segment {
                self.index = next.start();
            }
            if index < limit {
                return Some(Span {
                    segment,
                    index,
                    bytes: segment.bytes(index..limit),
                });
            }
        }
    }
}

/// Iterator over the contiguous byte spans of a [`ReadableBuffer`](crate::ReadableBuffer).
pub struct Spans<'a> {
    pub(crate) inner: SegmentSpans<'a>,
}

impl<'a> Iterator for Spans<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|span| span.bytes)
    }
}
