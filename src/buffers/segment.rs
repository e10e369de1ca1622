use std::{
    fmt,
    ops::Range,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use super::cursor::Cursor;
use crate::pool::Block;

/// A live window `[start, end)` over a pool block, linked to the next window of the chain.
///
/// Indexes are absolute within the block. `end` only grows and is published with release
/// semantics: every byte below it is immutable from then on. A read-only segment is a clone over
/// a range of someone else's block and is never written through.
pub(crate) struct Segment {
    block: Block,
    start: usize,
    end: AtomicUsize,
    next: OnceLock<Arc<Segment>>,
    read_only: bool,
    sealed: AtomicBool,
}

impl Segment {
    /// Creates an empty writable segment over a freshly leased block.
    pub(crate) fn new(block: Block) -> Arc<Self> {
        Arc::new(Self {
            block,
            start: 0,
            end: AtomicUsize::new(0),
            next: OnceLock::new(),
            read_only: false,
            sealed: AtomicBool::new(false),
        })
    }

    /// Creates a read-only segment sharing the bytes in `range` of this segment's block.
    pub(crate) fn read_only(&self, range: Range<usize>) -> Self {
        debug_assert!(self.start <= range.start && range.start <= range.end);
        Self {
            block: self.block.clone(),
            start: range.start,
            end: AtomicUsize::new(range.end),
            next: OnceLock::new(),
            read_only: true,
            sealed: AtomicBool::new(true),
        }
    }

    pub(crate) fn start(&self) -> usize {
        self.start
    }

    pub(crate) fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    /// Publishes the bytes written up to `end`.
    pub(crate) fn set_end(&self, end: usize) {
        debug_assert!(!self.read_only && end >= self.end() && end <= self.capacity());
        self.end.store(end, Ordering::Release);
    }

    pub(crate) fn capacity(&self) -> usize {
        self.block.capacity()
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of bytes that can still be written past `end`.
    pub(crate) fn spare(&self) -> usize {
        if self.sealed.load(Ordering::Acquire) { 0 } else { self.capacity() - self.end() }
    }

    /// Forbids any further write past `end`.
    ///
    /// Used when bytes past `end` may still be referenced by read-only clones.
    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub(crate) fn next(&self) -> Option<&Arc<Segment>> {
        self.next.get()
    }

    /// Links `next` after this segment. A segment is linked at most once.
    pub(crate) fn link(&self, next: Arc<Segment>) -> bool {
        self.next.set(next).is_ok()
    }

    /// Returns the published bytes in `range`.
    ///
    /// # Panics
    ///
    /// Panics if `range` is not within `[start, end)`.
    pub(crate) fn bytes(&self, range: Range<usize>) -> &[u8] {
        assert!(
            self.start <= range.start && range.start <= range.end && range.end <= self.end(),
            "Range {range:?} out of segment [{}, {})",
            self.start,
            self.end()
        );
        // SAFETY: bytes below the published end are never written again while the block is
        // referenced, and the range is within the block capacity.
        unsafe { self.block.slice(range) }
    }

    /// Returns the unpublished bytes in `range` for writing.
    ///
    /// # Safety
    ///
    /// The caller must be the single producer owning this segment, `range` must start at or
    /// after the published end and lie within the block capacity, and the returned slice must not
    /// outlive the next publication of `end`.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn spare_mut(&self, range: Range<usize>) -> &mut [u8] {
        debug_assert!(!self.read_only);
        debug_assert!(range.start >= self.end() && range.end <= self.capacity());
        // SAFETY: exclusivity and bounds are guaranteed by the caller.
        unsafe { self.block.slice_mut(range) }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Unlink iteratively so that dropping a long chain does not recurse.
        let mut next = self.next.take();
        while let Some(segment) = next {
            next = match Arc::into_inner(segment) {
                Some(mut segment) => segment.next.take(),
                None => None,
            };
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("start", &self.start)
            .field("end", &self.end())
            .field("capacity", &self.capacity())
            .field("read_only", &self.is_read_only())
            .field("sealed", &self.sealed.load(Ordering::Relaxed))
            .field("linked", &self.next.get().is_some())
            .finish()
    }
}

/// Accumulates read-only segments into a new chain.
#[derive(Default)]
pub(crate) struct ChainBuilder {
    segments: Vec<Segment>,
    len: usize,
}

impl ChainBuilder {
    pub(crate) fn push(&mut self, segment: &Segment, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        self.len += range.len();
        self.segments.push(segment.read_only(range));
    }

    /// Links the accumulated segments and returns the chain head, tail and length.
    pub(crate) fn finish(self) -> Option<(Arc<Segment>, Arc<Segment>, usize)> {
        let mut segments = self.segments.into_iter().rev();
        let tail = Arc::new(segments.next()?);
        let mut head = Arc::clone(&tail);
        for segment in segments {
            segment.link(head);
            head = Arc::new(segment);
        }
        Some((head, tail, self.len))
    }
}

/// Clones the bytes in `[begin, end)` into a new chain of read-only segments sharing the same
/// blocks. Returns `None` if the range is empty.
pub(crate) fn clone_range(begin: &Cursor, end: &Cursor) -> Option<(Arc<Segment>, Arc<Segment>, usize)> {
    let mut builder = ChainBuilder::default();
    for span in begin.spans_to(end) {
        builder.push(span.segment, span.index..span.index + span.bytes.len());
    }
    builder.finish()
}
