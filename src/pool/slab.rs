use std::{
    alloc::{self, Layout},
    fmt,
    ptr::{self, NonNull},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Alignment used for page-aligned slabs.
pub const PAGE_SIZE: usize = 4096;

/// How a slab obtains its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backing {
    /// A zeroed boxed slice from the global allocator.
    Boxed,
    /// A zeroed allocation aligned to [`PAGE_SIZE`].
    Aligned,
}

/// A large contiguous allocation carved into fixed-size blocks.
///
/// The slab owns the raw memory and frees it on drop. Every [`RawBlock`] carved from a slab
/// keeps an `Arc` to it, so the memory outlives the pool as long as a block is still in use.
pub(crate) struct Slab {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
    active: AtomicBool,
}

// SAFETY: the slab owns its allocation. Concurrent access to the bytes is coordinated by the
// block/segment protocol: a block region is written by at most one writer and only read up to
// the published end of its segment.
unsafe impl Send for Slab {}
// SAFETY: see above, the slab itself exposes no interior mutability except the atomic flag.
unsafe impl Sync for Slab {}

impl Slab {
    pub(crate) fn new(len: usize, backing: Backing) -> Self {
        assert!(len > 0, "Slab length must be greater than 0");
        let ptr = match backing {
            Backing::Boxed => {
                let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
                // SAFETY: `Box::into_raw` never returns a null pointer.
                unsafe { NonNull::new_unchecked(raw as *mut u8) }
            }
            Backing::Aligned => {
                let layout = Self::aligned_layout(len);
                // SAFETY: the layout has a non-zero size, checked above.
                let raw = unsafe { alloc::alloc_zeroed(layout) };
                match NonNull::new(raw) {
                    Some(ptr) => ptr,
                    None => alloc::handle_alloc_error(layout),
                }
            }
        };
        Self {
            ptr,
            len,
            backing,
            active: AtomicBool::new(true),
        }
    }

    fn aligned_layout(len: usize) -> Layout {
        match Layout::from_size_align(len, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("Slab of {len} bytes cannot be aligned to {PAGE_SIZE}"),
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the slab as inactive: blocks returning to the pool are abandoned from now on.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Splits the slab into `block_size` blocks.
    pub(crate) fn carve(self: &Arc<Self>, block_size: usize) -> impl Iterator<Item = RawBlock> + '_ {
        (0..self.len / block_size).map(move |i| RawBlock {
            slab: Arc::clone(self),
            offset: i * block_size,
            len: block_size,
        })
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        match self.backing {
            Backing::Boxed => {
                let raw = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
                // SAFETY: the pointer and length come from `Box::into_raw` in `Slab::new`.
                drop(unsafe { Box::from_raw(raw) });
            }
            Backing::Aligned => {
                // SAFETY: the pointer was allocated in `Slab::new` with the very same layout.
                unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::aligned_layout(self.len)) };
            }
        }
    }
}

impl fmt::Debug for Slab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("backing", &self.backing)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A block-sized byte range inside a slab, owned by whoever holds it.
pub(crate) struct RawBlock {
    slab: Arc<Slab>,
    offset: usize,
    len: usize,
}

impl RawBlock {
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn slab(&self) -> &Arc<Slab> {
        &self.slab
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        // SAFETY: `offset + len <= slab.len` by construction in `Slab::carve`.
        unsafe { self.slab.ptr.as_ptr().add(self.offset) }
    }
}

impl fmt::Debug for RawBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBlock")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_carve() {
        // 1. Boxed slab is carved into disjoint blocks
        let slab = Arc::new(Slab::new(4 * 64, Backing::Boxed));
        let blocks: Vec<_> = slab.carve(64).collect();
        assert_eq!(blocks.len(), 4);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.len(), 64);
            assert_eq!(block.as_ptr() as usize, slab.ptr.as_ptr() as usize + i * 64);
        }
        assert_eq!(Arc::strong_count(&slab), 5);

        // 2. Blocks keep the slab alive
        drop(blocks);
        assert_eq!(Arc::strong_count(&slab), 1);

        // 3. A trailing remainder smaller than a block is not handed out
        let slab = Arc::new(Slab::new(100, Backing::Boxed));
        assert_eq!(slab.carve(64).count(), 1);
    }

    #[test]
    fn slab_aligned() {
        let slab = Slab::new(2 * PAGE_SIZE, Backing::Aligned);
        assert_eq!(slab.ptr.as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(slab.len(), 2 * PAGE_SIZE);
    }

    #[test]
    fn slab_deactivate() {
        let slab = Slab::new(64, Backing::Boxed);
        assert!(slab.is_active());
        slab.deactivate();
        assert!(!slab.is_active());
    }
}
