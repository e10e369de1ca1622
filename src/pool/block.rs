use std::{
    fmt,
    ops::Range,
    slice,
    sync::{Arc, Weak},
};

use super::{MemoryPool, PoolInner, slab::RawBlock};

/// A reference-counted handle to a block of pooled memory.
///
/// A [`Block`] is obtained from [`MemoryPool::lease`]. Cloning it is cheap and only increments a
/// reference count: all the clones share the same bytes. When the last clone is dropped the block
/// goes back to the pool it was leased from (or is abandoned if its slab has been trimmed in the
/// meantime), so forgetting to call [`MemoryPool::release`] never leaks pool capacity.
///
/// The bytes of a block are only reachable through the segments built on top of it; see
/// [`ReadableBuffer`](crate::ReadableBuffer) and [`WritableBuffer`](crate::WritableBuffer).
#[derive(Clone)]
pub struct Block {
    lease: Arc<Lease>,
}

struct Lease {
    raw: Option<RawBlock>,
    ptr: *mut u8,
    len: usize,
    pool: Weak<PoolInner>,
}

// SAFETY: `ptr` points into the slab kept alive by `raw`, which is `Send + Sync`.
unsafe impl Send for Lease {}
// SAFETY: see above.
unsafe impl Sync for Lease {}

impl Block {
    pub(crate) fn new(raw: RawBlock, pool: Weak<PoolInner>) -> Self {
        let lease = Lease {
            ptr: raw.as_ptr(),
            len: raw.len(),
            raw: Some(raw),
            pool,
        };
        Self { lease: Arc::new(lease) }
    }

    /// Returns the number of bytes in the block.
    pub fn capacity(&self) -> usize {
        self.lease.len
    }

    /// Returns how many handles (segments, clones) currently share this block.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.lease)
    }

    /// Returns `true` if this block was leased from `pool`.
    pub fn is_from(&self, pool: &MemoryPool) -> bool {
        Weak::as_ptr(&self.lease.pool) == Arc::as_ptr(&pool.inner)
    }

    /// Returns `true` if both handles refer to the same block.
    pub fn ptr_eq(&self, other: &Block) -> bool {
        Arc::ptr_eq(&self.lease, &other.lease)
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.lease.ptr
    }

    /// Returns the bytes in `range`.
    ///
    /// # Safety
    ///
    /// `range` must be within the block capacity and must not be concurrently written, i.e. it
    /// must lie below the published end of the segment the caller reads through.
    pub(crate) unsafe fn slice(&self, range: Range<usize>) -> &[u8] {
        debug_assert!(range.start <= range.end && range.end <= self.lease.len);
        // SAFETY: bounds and exclusivity are guaranteed by the caller.
        unsafe { slice::from_raw_parts(self.lease.ptr.add(range.start), range.end - range.start) }
    }

    /// Returns the bytes in `range` for writing.
    ///
    /// # Safety
    ///
    /// `range` must be within the block capacity and the caller must be the only writer of the
    /// block, writing past the published end of its segment.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [u8] {
        debug_assert!(range.start <= range.end && range.end <= self.lease.len);
        // SAFETY: bounds and exclusivity are guaranteed by the caller.
        unsafe { slice::from_raw_parts_mut(self.lease.ptr.add(range.start), range.end - range.start) }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(raw) = self.raw.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => pool.recycle(raw),
            // The pool is gone: dropping `raw` frees the slab once its last block is gone.
            None => drop(raw),
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("ptr", &self.lease.ptr)
            .field("capacity", &self.lease.len)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
