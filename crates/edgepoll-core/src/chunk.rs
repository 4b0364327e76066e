//! `Chunk` and `ChunkPool` - the fixed-size blocks behind every connection
//! buffer.
//!
//! A chunk is a boxed 4 KiB block plus a used-length. It is owned either by
//! the pool (available for lease) or by exactly one `ChunkBuffer`. Moving a
//! chunk between the two moves the `Box` handle; the bytes never move.
//!
//! The pool is an unbounded lock-free free-list (`SegQueue`). It never
//! refuses a lease: when empty it allocates. It never shrinks either, so
//! its footprint is the high-water mark of concurrently buffered data.

use crate::constants::CHUNK_SIZE;

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// A fixed-capacity byte block with a tracked used-length.
///
/// Bytes past `len()` are unspecified: a recycled chunk keeps whatever an
/// earlier owner wrote there.
pub struct Chunk {
    data: Box<[u8; CHUNK_SIZE]>,
    len: usize,
}

impl Chunk {
    fn alloc() -> Self {
        Self {
            data: Box::new([0u8; CHUNK_SIZE]),
            len: 0,
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        CHUNK_SIZE
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Spare capacity after the used bytes.
    #[inline]
    pub fn remaining(&self) -> usize {
        CHUNK_SIZE - self.len
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == CHUNK_SIZE
    }

    /// The used bytes.
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Append as much of `src` as fits; returns the number of bytes taken.
    #[inline]
    pub fn append(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Forget the content without touching the backing memory.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk").field("len", &self.len).finish()
    }
}

/// Shared lease/release pool of chunks.
pub struct ChunkPool {
    free: SegQueue<Chunk>,
    /// Chunks ever allocated by this pool.
    created: AtomicUsize,
    /// Chunks currently out on lease.
    in_use: AtomicUsize,
}

static GLOBAL_POOL: OnceLock<Arc<ChunkPool>> = OnceLock::new();

impl ChunkPool {
    pub fn new() -> Self {
        Self {
            free: SegQueue::new(),
            created: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    /// The process-wide pool every `ChunkBuffer::new()` draws from.
    pub fn global() -> Arc<ChunkPool> {
        GLOBAL_POOL.get_or_init(|| Arc::new(ChunkPool::new())).clone()
    }

    /// Take a chunk with length 0. Allocates when the free-list is empty.
    pub fn lease(&self) -> Chunk {
        let chunk = match self.free.pop() {
            Some(mut chunk) => {
                chunk.clear();
                chunk
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                Chunk::alloc()
            }
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        chunk
    }

    /// Return a chunk. Any used-length is accepted; the next lease clears it.
    pub fn release(&self, chunk: Chunk) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.free.push(chunk);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Chunks sitting on the free-list.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new()
    }
}
