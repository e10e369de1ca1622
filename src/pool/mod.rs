//! Pooled memory: slabs carved into fixed-size, reference-counted blocks.
//!
//! A [`MemoryPool`] hands out [`Block`]s of a fixed stride (`block_size`). Blocks are carved out of
//! large slabs that are allocated on demand. Free blocks are kept in cache-padded stripes selected
//! per thread, so unrelated threads leasing and returning blocks do not contend on the same queue.
//!
//! ```
//! use sluice::MemoryPool;
//!
//! let pool = MemoryPool::builder().block_size(1024).blocks_per_slab(4).build();
//! let block = pool.lease(512).unwrap();
//! assert_eq!(block.capacity(), 1024);
//! assert_eq!(pool.stats().leased_blocks, 1);
//!
//! pool.release(block).unwrap();
//! assert_eq!(pool.stats().available_blocks, 4);
//! ```
mod block;
mod slab;

use std::{
    fmt,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

pub use block::Block;
use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
pub use slab::PAGE_SIZE;
use slab::{Backing, RawBlock, Slab};
use thiserror::Error;

/// Default size in bytes of a pool block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// Default number of blocks allocated at once when the pool grows.
pub const DEFAULT_BLOCKS_PER_SLAB: usize = 32;

/// Errors returned by [`MemoryPool`] operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The requested contiguous size is larger than the pool block size.
    ///
    /// The caller must split the request into writes of at most `block_size` bytes.
    #[error("Requested {requested} contiguous bytes but the pool block size is {block_size}")]
    CapacityExceeded {
        /// The number of bytes requested.
        requested: usize,
        /// The block size of the pool.
        block_size: usize,
    },

    /// A bounded pool has leased all the blocks it is allowed to allocate.
    #[error("The pool has no free block left (maximum is {max_blocks} blocks)")]
    Exhausted {
        /// The configured maximum number of blocks.
        max_blocks: usize,
    },

    /// The block was leased from a different pool.
    #[error("The block does not belong to this pool")]
    ForeignBlock,
}

/// A point-in-time snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Size in bytes of every block.
    pub block_size: usize,
    /// Number of blocks counted against `max_blocks`: free ones plus every leased one, including
    /// blocks of trimmed slabs not returned yet.
    pub total_blocks: usize,
    /// Number of blocks currently leased.
    pub leased_blocks: usize,
    /// Number of blocks ready to be leased.
    pub available_blocks: usize,
    /// Number of active slabs.
    pub slabs: usize,
}

/// A pool of fixed-size memory blocks.
///
/// The pool is cheaply cloneable: clones share the same slabs and free lists.
///
/// # Growth
///
/// An unbounded pool allocates a new slab of `blocks_per_slab` blocks whenever every free list is
/// empty. A bounded pool (see [`MemoryPoolBuilder::max_blocks`]) never allocates more than
/// `max_blocks` blocks and fails with [`PoolError::Exhausted`] instead of growing.
///
/// # Returning blocks
///
/// Blocks return to the pool when their last handle is dropped. [`MemoryPool::release`] is an
/// explicit spelling of that drop which also checks the block belongs to this pool.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    /// Creates a pool with the default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Returns a builder to configure a new pool.
    pub fn builder() -> MemoryPoolBuilder {
        MemoryPoolBuilder::new()
    }

    /// Returns the size in bytes of the blocks handed out by this pool.
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Number of blocks that can still be leased, `None` when the pool is unbounded.
    pub(crate) fn leasable_blocks(&self) -> Option<usize> {
        let max_blocks = self.inner.max_blocks?;
        let total = self.inner.total.load(Ordering::Acquire);
        let available = self.inner.available.load(Ordering::Acquire);
        Some(available + max_blocks.saturating_sub(total))
    }

    /// Leases a block able to hold at least `min_size` contiguous bytes.
    ///
    /// # Errors
    ///
    /// - [`PoolError::CapacityExceeded`] if `min_size` is larger than the block size.
    /// - [`PoolError::Exhausted`] if the pool is bounded and all its blocks are leased.
    pub fn lease(&self, min_size: usize) -> Result<Block, PoolError> {
        if min_size > self.inner.block_size {
            return Err(PoolError::CapacityExceeded {
                requested: min_size,
                block_size: self.inner.block_size,
            });
        }
        let raw = match self.inner.pop() {
            Some(raw) => raw,
            None => self.inner.grow()?,
        };
        self.inner.leased.fetch_add(1, Ordering::AcqRel);
        Ok(Block::new(raw, Arc::downgrade(&self.inner)))
    }

    /// Gives a block handle back to the pool.
    ///
    /// The block becomes available again once every clone of it has been released.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ForeignBlock`] if the block was leased from another pool. The handle
    /// is dropped anyway and goes back to the pool it came from.
    pub fn release(&self, block: Block) -> Result<(), PoolError> {
        if block.is_from(self) {
            drop(block);
            Ok(())
        } else {
            Err(PoolError::ForeignBlock)
        }
    }

    /// Deactivates every slab and drops the blocks currently sitting in the free lists.
    ///
    /// Blocks still leased from a deactivated slab are abandoned when returned and the slab
    /// memory is freed with the last of them. Until then they still count against `max_blocks`.
    /// Later leases allocate fresh slabs.
    ///
    /// Returns the number of free blocks dropped.
    pub fn trim(&self) -> usize {
        self.inner.trim()
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            block_size: self.inner.block_size,
            total_blocks: self.inner.total.load(Ordering::Acquire),
            leased_blocks: self.inner.leased.load(Ordering::Acquire),
            available_blocks: self.inner.available.load(Ordering::Acquire),
            slabs: self.inner.slabs.lock().len(),
        }
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool").field("stats", &self.stats()).finish()
    }
}

/// Builder for [`MemoryPool`].
#[derive(Debug, Clone)]
pub struct MemoryPoolBuilder {
    block_size: usize,
    blocks_per_slab: usize,
    max_blocks: Option<usize>,
    backing: Backing,
    stripes: usize,
}

impl MemoryPoolBuilder {
    fn new() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            blocks_per_slab: DEFAULT_BLOCKS_PER_SLAB,
            max_blocks: None,
            backing: Backing::Boxed,
            stripes: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
        }
    }

    /// Sets the size in bytes of every block.
    ///
    /// Default: [`DEFAULT_BLOCK_SIZE`]
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets how many blocks are allocated at once when the pool grows.
    ///
    /// Default: [`DEFAULT_BLOCKS_PER_SLAB`]
    pub fn blocks_per_slab(mut self, blocks_per_slab: usize) -> Self {
        self.blocks_per_slab = blocks_per_slab;
        self
    }

    /// Bounds the number of blocks the pool may allocate.
    ///
    /// Default: unbounded
    pub fn max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = Some(max_blocks);
        self
    }

    /// Allocates slabs aligned to [`PAGE_SIZE`] instead of plain heap slices.
    pub fn aligned(mut self, aligned: bool) -> Self {
        self.backing = if aligned { Backing::Aligned } else { Backing::Boxed };
        self
    }

    /// Sets the number of free-list stripes.
    ///
    /// Default: the available parallelism of the machine
    pub fn stripes(mut self, stripes: usize) -> Self {
        self.stripes = stripes;
        self
    }

    /// Builds the pool.
    ///
    /// # Panics
    ///
    /// Panics if `block_size`, `blocks_per_slab`, `stripes` or `max_blocks` is zero.
    pub fn build(self) -> MemoryPool {
        assert!(self.block_size > 0, "Block size must be greater than 0");
        assert!(self.blocks_per_slab > 0, "Blocks per slab must be greater than 0");
        assert!(self.stripes > 0, "Stripes must be greater than 0");
        assert!(self.max_blocks != Some(0), "Max blocks must be greater than 0");

        let stripes = (0..self.stripes)
            .map(|_| CachePadded::new(SegQueue::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        MemoryPool {
            inner: Arc::new(PoolInner {
                block_size: self.block_size,
                blocks_per_slab: self.blocks_per_slab,
                max_blocks: self.max_blocks,
                backing: self.backing,
                stripes,
                slabs: Mutex::new(Vec::new()),
                total: AtomicUsize::new(0),
                leased: AtomicUsize::new(0),
                available: AtomicUsize::new(0),
            }),
        }
    }
}

static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static STRIPE_HINT: usize = NEXT_STRIPE.fetch_add(1, Ordering::Relaxed);
}

pub(crate) struct PoolInner {
    block_size: usize,
    blocks_per_slab: usize,
    max_blocks: Option<usize>,
    backing: Backing,
    stripes: Box<[CachePadded<SegQueue<RawBlock>>]>,
    slabs: Mutex<Vec<Arc<Slab>>>,
    total: AtomicUsize,
    leased: AtomicUsize,
    available: AtomicUsize,
}

impl PoolInner {
    fn stripe_index(&self) -> usize {
        STRIPE_HINT.with(|hint| *hint) % self.stripes.len()
    }

    /// Pops a free block, first from the local stripe and then stealing from the others.
    fn pop(&self) -> Option<RawBlock> {
        let local = self.stripe_index();
        let n = self.stripes.len();
        (0..n).find_map(|i| {
            let raw = self.stripes[(local + i) % n].pop()?;
            self.available.fetch_sub(1, Ordering::AcqRel);
            Some(raw)
        })
    }

    /// Reserves room for up to `blocks_per_slab` new blocks, honoring `max_blocks`.
    fn reserve(&self) -> Result<usize, PoolError> {
        let Some(max_blocks) = self.max_blocks else {
            self.total.fetch_add(self.blocks_per_slab, Ordering::AcqRel);
            return Ok(self.blocks_per_slab);
        };
        let mut current = self.total.load(Ordering::Acquire);
        loop {
            let count = self.blocks_per_slab.min(max_blocks.saturating_sub(current));
            if count == 0 {
                return Err(PoolError::Exhausted { max_blocks });
            }
            match self
                .total
                .compare_exchange_weak(current, current + count, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(count),
                Err(actual) => current = actual,
            }
        }
    }

    /// Allocates a new slab, keeps one block for the caller and seeds the local stripe.
    fn grow(&self) -> Result<RawBlock, PoolError> {
        let count = self.reserve()?;
        let slab = Arc::new(Slab::new(count * self.block_size, self.backing));
        tracing::debug!(
            block_size = self.block_size,
            blocks = count,
            bytes = slab.len(),
            "Allocated a new slab"
        );

        let stripe = &self.stripes[self.stripe_index()];
        let mut blocks = slab.carve(self.block_size);
        let first = blocks.next();
        for raw in blocks {
            stripe.push(raw);
            self.available.fetch_add(1, Ordering::AcqRel);
        }
        self.slabs.lock().push(Arc::clone(&slab));

        // `count > 0` is guaranteed by `reserve`, so the slab always holds at least one block.
        first.ok_or(PoolError::Exhausted {
            max_blocks: self.max_blocks.unwrap_or(0),
        })
    }

    /// Takes back a block whose last handle has been dropped.
    pub(crate) fn recycle(&self, raw: RawBlock) {
        self.leased.fetch_sub(1, Ordering::AcqRel);
        if raw.slab().is_active() {
            self.stripes[self.stripe_index()].push(raw);
            self.available.fetch_add(1, Ordering::AcqRel);
        } else {
            self.total.fetch_sub(1, Ordering::AcqRel);
            tracing::trace!("Abandoned a block of a deactivated slab");
        }
    }

    fn trim(&self) -> usize {
        let slabs = std::mem::take(&mut *self.slabs.lock());
        for slab in slabs.iter() {
            slab.deactivate();
        }

        let mut dropped = 0;
        for stripe in self.stripes.iter() {
            while let Some(raw) = stripe.pop() {
                self.available.fetch_sub(1, Ordering::AcqRel);
                drop(raw);
                dropped += 1;
            }
        }

        // Leased blocks keep counting against `max_blocks` until they come back
        self.total.fetch_sub(dropped, Ordering::AcqRel);
        tracing::debug!(slabs = slabs.len(), blocks = dropped, "Trimmed the memory pool");
        dropped
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        tracing::debug!(
            slabs = self.slabs.get_mut().len(),
            leased = *self.leased.get_mut(),
            "Dropping the memory pool"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::seq::SliceRandom;

    use super::*;

    fn addr(block: &Block) -> usize {
        block.as_ptr() as usize
    }

    #[test]
    fn pool_lease_release() {
        let pool = MemoryPool::builder().block_size(64).blocks_per_slab(4).build();

        // 1. First lease allocates a slab
        let b1 = pool.lease(0).unwrap();
        assert_eq!(b1.capacity(), 64);
        assert!(b1.is_from(&pool));
        let stats = pool.stats();
        assert_eq!(stats.slabs, 1);
        assert_eq!(stats.total_blocks, 4);
        assert_eq!(stats.leased_blocks, 1);
        assert_eq!(stats.available_blocks, 3);

        // 2. Clones share the block and only the last drop returns it
        let b2 = b1.clone();
        assert_eq!(b1.ref_count(), 2);
        assert!(b1.ptr_eq(&b2));
        drop(b2);
        assert_eq!(pool.stats().leased_blocks, 1);
        pool.release(b1).unwrap();
        assert_eq!(pool.stats().leased_blocks, 0);
        assert_eq!(pool.stats().available_blocks, 4);

        // 3. A block from another pool is refused
        let other = MemoryPool::builder().block_size(64).build();
        let foreign = other.lease(1).unwrap();
        assert_eq!(pool.release(foreign), Err(PoolError::ForeignBlock));
        assert_eq!(other.stats().leased_blocks, 0);
    }

    #[test]
    fn pool_capacity_exceeded() {
        let pool = MemoryPool::builder().block_size(64).build();
        assert!(pool.lease(64).is_ok());
        assert_eq!(
            pool.lease(65).unwrap_err(),
            PoolError::CapacityExceeded {
                requested: 65,
                block_size: 64
            }
        );
    }

    #[test]
    fn pool_bounded() {
        let pool = MemoryPool::builder()
            .block_size(32)
            .blocks_per_slab(3)
            .max_blocks(5)
            .build();

        let mut blocks: Vec<_> = (0..5).map(|_| pool.lease(1).unwrap()).collect();
        assert_eq!(pool.stats().total_blocks, 5);
        assert_eq!(pool.stats().slabs, 2);
        assert_eq!(pool.lease(1).unwrap_err(), PoolError::Exhausted { max_blocks: 5 });

        // Returning a block makes room again without growing
        blocks.pop();
        assert!(pool.lease(1).is_ok());
        assert_eq!(pool.stats().total_blocks, 5);
    }

    #[test]
    fn pool_round_trip() {
        const N: usize = 64;
        let pool = MemoryPool::builder()
            .block_size(16)
            .blocks_per_slab(8)
            .max_blocks(N)
            .stripes(4)
            .build();

        let check = |pool: &MemoryPool| {
            let stats = pool.stats();
            assert_eq!(stats.leased_blocks + stats.available_blocks, stats.total_blocks);
        };

        // 1. Lease everything
        let mut blocks = Vec::with_capacity(N);
        for _ in 0..N {
            blocks.push(pool.lease(16).unwrap());
            check(&pool);
        }
        assert!(pool.lease(1).is_err());
        let first: HashSet<usize> = blocks.iter().map(addr).collect();
        assert_eq!(first.len(), N);

        // 2. Return everything in random order
        blocks.shuffle(&mut rand::rng());
        for block in blocks.drain(..) {
            pool.release(block).unwrap();
            check(&pool);
        }
        assert_eq!(pool.stats().available_blocks, N);

        // 3. Lease again: the very same blocks, no duplicates
        let again: Vec<_> = (0..N).map(|_| pool.lease(1).unwrap()).collect();
        let second: HashSet<usize> = again.iter().map(addr).collect();
        assert_eq!(second.len(), N);
        assert_eq!(first, second);
        check(&pool);
    }

    #[test]
    fn pool_trim() {
        let pool = MemoryPool::builder().block_size(64).blocks_per_slab(4).build();
        let kept = pool.lease(1).unwrap();

        // 1. Free blocks are dropped, the leased one survives
        assert_eq!(pool.trim(), 3);
        let stats = pool.stats();
        assert_eq!(stats.slabs, 0);
        assert_eq!(stats.total_blocks, 1);
        assert_eq!(stats.available_blocks, 0);
        assert_eq!(stats.leased_blocks, 1);

        // 2. The outstanding block is abandoned on return
        drop(kept);
        let stats = pool.stats();
        assert_eq!(stats.total_blocks, 0);
        assert_eq!(stats.leased_blocks, 0);
        assert_eq!(stats.available_blocks, 0);

        // 3. New leases come from a fresh slab
        let _fresh = pool.lease(1).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.slabs, 1);
        assert_eq!(stats.total_blocks, 4);
        assert_eq!(stats.available_blocks, 3);
    }

    #[test]
    fn pool_trim_keeps_bound() {
        let pool = MemoryPool::builder()
            .block_size(16)
            .blocks_per_slab(4)
            .max_blocks(4)
            .build();
        let held: Vec<_> = (0..4).map(|_| pool.lease(1).unwrap()).collect();

        // Outstanding blocks still count against the bound after a trim
        assert_eq!(pool.trim(), 0);
        assert_eq!(pool.stats().total_blocks, 4);
        assert_eq!(pool.lease(1).unwrap_err(), PoolError::Exhausted { max_blocks: 4 });

        // Abandoning them makes room for a fresh slab
        drop(held);
        assert_eq!(pool.stats().total_blocks, 0);
        let fresh: Vec<_> = (0..4).map(|_| pool.lease(1).unwrap()).collect();
        assert_eq!(pool.stats().leased_blocks, 4);
        assert_eq!(pool.lease(1).unwrap_err(), PoolError::Exhausted { max_blocks: 4 });
        drop(fresh);
    }

    #[test]
    fn pool_dropped_before_blocks() {
        let pool = MemoryPool::builder().block_size(64).aligned(true).build();
        let block = pool.lease(1).unwrap();
        assert_eq!(addr(&block) % PAGE_SIZE, 0);
        drop(pool);
        // The slab stays alive with the block
        assert_eq!(block.capacity(), 64);
        drop(block);
    }

    #[test]
    fn pool_concurrent() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 10_000;

        let pool = MemoryPool::builder().block_size(8).blocks_per_slab(16).build();
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for i in 0..ROUNDS {
                        held.push(pool.lease(8).unwrap());
                        if i % 3 == 0 {
                            held.clear();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.leased_blocks, 0);
        assert_eq!(stats.available_blocks, stats.total_blocks);
    }
}
