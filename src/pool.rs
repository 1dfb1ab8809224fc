//! Reusable byte blocks and message instances.
//!
//! Every connection allocates its header and body buffers from a shared
//! [`BlockPool`]. Blocks go back to the pool when they are dropped, so a
//! buffer releases its memory simply by clearing its block list.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, PoisonError},
};

/// Size of one pooled block.
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024;

/// Number of idle blocks a pool keeps around.
pub const DEFAULT_MAX_CACHED_BLOCKS: usize = 64;

/// Number of idle message instances a pool keeps around.
pub const DEFAULT_MAX_CACHED_INSTANCES: usize = 50;

/// A pool of fixed-size byte blocks.
///
/// Cheap to clone; all clones share the same free list.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<BlockPoolInner>,
}

struct BlockPoolInner {
    block_size: usize,
    max_cached: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("block_size", &self.block_size())
            .field("cached", &self.cached())
            .finish()
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, DEFAULT_MAX_CACHED_BLOCKS)
    }
}

impl BlockPool {
    /// Creates a pool handing out blocks of `block_size` bytes.
    pub fn new(block_size: usize, max_cached: usize) -> Self {
        Self {
            inner: Arc::new(BlockPoolInner {
                block_size: block_size.max(1),
                max_cached,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the size of each block.
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Returns the number of idle blocks held by the pool.
    pub fn cached(&self) -> usize {
        self.free().len()
    }

    /// Takes a block from the pool, allocating a new one if none is idle.
    pub fn alloc(&self) -> Block {
        let data = self
            .free()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.block_size].into_boxed_slice());
        Block {
            data,
            pool: self.clone(),
        }
    }

    fn release(&self, data: Box<[u8]>) {
        if data.len() != self.inner.block_size {
            return;
        }
        let mut free = self.free();
        if free.len() < self.inner.max_cached {
            free.push(data);
        }
    }

    fn free(&self) -> std::sync::MutexGuard<'_, Vec<Box<[u8]>>> {
        self.inner.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A block borrowed from a [`BlockPool`].
///
/// Returns to its pool on drop.
pub struct Block {
    data: Box<[u8]>,
    pool: BlockPool,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({})", self.data.len())
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.release(data);
    }
}

/// Types that can be recycled through an [`InstancePool`].
pub trait Poolable: Send + Sized + 'static {
    /// Creates a fresh instance drawing its buffers from `blocks`.
    fn create(blocks: &BlockPool) -> Self;

    /// Clears all per-message state so the instance can be reused.
    fn reset(&mut self);
}

/// A pool of reusable message instances.
pub struct InstancePool<T> {
    blocks: BlockPool,
    max_cached: usize,
    free: Arc<Mutex<Vec<T>>>,
}

impl<T> fmt::Debug for InstancePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePool")
            .field("max_cached", &self.max_cached)
            .finish_non_exhaustive()
    }
}

impl<T> Clone for InstancePool<T> {
    fn clone(&self) -> Self {
        Self {
            blocks: self.blocks.clone(),
            max_cached: self.max_cached,
            free: self.free.clone(),
        }
    }
}

impl<T: Poolable> InstancePool<T> {
    /// Creates an instance pool whose instances allocate from `blocks`.
    pub fn new(blocks: BlockPool, max_cached: usize) -> Self {
        Self {
            blocks,
            max_cached,
            free: Default::default(),
        }
    }

    /// Takes an idle instance or creates a new one.
    pub fn alloc(&self) -> T {
        let cached = self.lock().pop();
        cached.unwrap_or_else(|| T::create(&self.blocks))
    }

    /// Hands an instance back to the pool.
    ///
    /// With `discard` set the instance is dropped instead of reused, which is
    /// what callers do after an instance observed an error.
    pub fn release(&self, mut item: T, discard: bool) {
        if discard {
            return;
        }
        item.reset();
        let mut free = self.lock();
        if free.len() < self.max_cached {
            free.push(item);
        }
    }

    /// Returns the number of idle instances.
    pub fn cached(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
