//! `ChunkBuffer` - FIFO byte stream over pooled chunks.
//!
//! ```text
//!   head_offset
//!       │
//!   ┌───▼──────────┐ ┌──────────────┐ ┌──────────┬───┐
//!   │xxx|..........│ │..............│ │..........│   │  ← write appends here
//!   └──────────────┘ └──────────────┘ └──────────┴───┘
//!     read drains from the front; drained chunks go back to the pool
//! ```
//!
//! Invariant: `total_len == Σ chunk.len() − head_offset`.
//!
//! A drained chunk is released unless it is the last one in the chain; the
//! last one is kept and reset instead. Under the common "small write, read
//! it all back" pattern the buffer therefore owns exactly one chunk and
//! never touches the pool.
//!
//! Single owner: one connection, one worker thread. No internal locking.

use crate::chunk::{Chunk, ChunkPool};

use std::collections::VecDeque;
use std::sync::Arc;

pub struct ChunkBuffer {
    chain: VecDeque<Chunk>,
    total_len: usize,
    head_offset: usize,
    pool: Arc<ChunkPool>,
}

impl ChunkBuffer {
    /// Empty buffer drawing from the process-wide pool.
    pub fn new() -> Self {
        Self::with_pool(ChunkPool::global())
    }

    /// Empty buffer drawing from `pool`.
    pub fn with_pool(pool: Arc<ChunkPool>) -> Self {
        Self {
            chain: VecDeque::new(),
            total_len: 0,
            head_offset: 0,
            pool,
        }
    }

    /// Unread bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.total_len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Chunks currently held, including a retained empty one.
    #[inline]
    pub fn chunks(&self) -> usize {
        self.chain.len()
    }

    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    /// Append all of `src`. Never partial.
    pub fn write(&mut self, mut src: &[u8]) -> usize {
        let n = src.len();
        self.total_len += n;

        while !src.is_empty() {
            let taken = match self.chain.back_mut() {
                Some(last) if !last.is_full() => last.append(src),
                _ => {
                    let mut chunk = self.pool.lease();
                    let taken = chunk.append(src);
                    self.chain.push_back(chunk);
                    taken
                }
            };
            src = &src[taken..];
        }
        n
    }

    /// Copy unread bytes into `dst` until it is full or the buffer is empty.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;

        while copied < dst.len() {
            let Some(first) = self.chain.front_mut() else {
                break;
            };
            let unread = &first.filled()[self.head_offset..];
            if unread.is_empty() {
                // only a retained, reset last chunk can be empty here
                break;
            }

            let n = unread.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&unread[..n]);
            copied += n;
            self.head_offset += n;

            if self.head_offset == first.len() {
                self.head_offset = 0;
                if self.chain.len() == 1 {
                    if let Some(last) = self.chain.back_mut() {
                        last.clear();
                    }
                    break;
                }
                if let Some(spent) = self.chain.pop_front() {
                    self.pool.release(spent);
                }
            }
        }

        self.total_len -= copied;
        copied
    }

    /// Release every chunk and reset. No-op when already empty.
    pub fn clean(&mut self) {
        for chunk in self.chain.drain(..) {
            self.pool.release(chunk);
        }
        self.total_len = 0;
        self.head_offset = 0;
    }
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ChunkBuffer {
    fn drop(&mut self) {
        self.clean();
    }
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("len", &self.total_len)
            .field("chunks", &self.chain.len())
            .field("head_offset", &self.head_offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CHUNK_SIZE;
    use std::thread;

    fn isolated() -> ChunkBuffer {
        ChunkBuffer::with_pool(Arc::new(ChunkPool::new()))
    }

    fn drain(buf: &mut ChunkBuffer, step: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(buf.len());
        let mut tmp = vec![0u8; step];
        loop {
            let n = buf.read(&mut tmp);
            out.extend_from_slice(&tmp[..n]);
            if n < tmp.len() {
                break;
            }
        }
        out
    }

    /// Tiny deterministic generator so the size mixes are reproducible.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn below(&mut self, n: usize) -> usize {
            (self.next() % n as u64) as usize
        }
    }

    #[test]
    fn test_zero_length_ops() {
        let mut buf = isolated();
        assert_eq!(buf.write(&[]), 0);
        assert_eq!(buf.chunks(), 0);
        assert_eq!(buf.read(&mut []), 0);

        buf.write(b"abc");
        assert_eq!(buf.read(&mut []), 0);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_write_fills_last_chunk_before_leasing() {
        let mut buf = isolated();
        buf.write(b"test");
        buf.write(b"test");
        assert_eq!(buf.chunks(), 1);
        assert_eq!(buf.len(), 8);

        buf.write(&vec![1u8; CHUNK_SIZE - 8]);
        assert_eq!(buf.chunks(), 1);
        buf.write(b"x");
        assert_eq!(buf.chunks(), 2);
        assert_eq!(buf.pool().in_use(), 2);
    }

    #[test]
    fn test_nine_fixed_writes_read_back_in_order() {
        let mut buf = isolated();
        let mut plain = Vec::new();

        for i in 1..=9usize {
            let fill = b'0' + i as u8;
            let data = vec![fill; i * 1024];
            assert_eq!(buf.write(&data), data.len());
            plain.extend_from_slice(&data);
        }
        assert_eq!(buf.len(), plain.len());

        let got = drain(&mut buf, 777);
        assert_eq!(got, plain);
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.chunks(), 1);
    }

    #[test]
    fn test_read_with_various_destination_sizes() {
        let data: Vec<u8> = b"1234567890".iter().copied().cycle().take(5000).collect();

        for step in [1, 4, 42, 123, 1024, 4 * 1024, 8 * 1024, 1024 * 1024] {
            let mut buf = isolated();
            buf.write(&data);
            let got = drain(&mut buf, step);
            assert_eq!(got.len(), data.len(), "step {}", step);
            assert_eq!(got, data, "step {}", step);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_multi_chunk_read_releases_all_drained() {
        let mut buf = isolated();
        buf.write(&vec![9u8; CHUNK_SIZE * 3 + 10]);
        assert_eq!(buf.chunks(), 4);

        let mut dst = vec![0u8; CHUNK_SIZE * 3 + 5];
        assert_eq!(buf.read(&mut dst), dst.len());
        assert_eq!(buf.chunks(), 1);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.pool().in_use(), 1);
        assert_eq!(buf.pool().available(), 3);
    }

    #[test]
    fn test_partial_head_survives_later_writes() {
        let mut buf = isolated();
        buf.write(&vec![b'a'; CHUNK_SIZE]);
        let mut dst = [0u8; 100];
        assert_eq!(buf.read(&mut dst), 100);

        buf.write(b"tail");
        let got = drain(&mut buf, 333);
        assert_eq!(got.len(), CHUNK_SIZE - 100 + 4);
        assert!(got[..CHUNK_SIZE - 100].iter().all(|&b| b == b'a'));
        assert_eq!(&got[CHUNK_SIZE - 100..], b"tail");
    }

    #[test]
    fn test_length_tracks_writes_minus_reads() {
        let mut rng = XorShift(0x9e37_79b9_7f4a_7c15);
        let mut buf = isolated();
        let mut written = 0usize;
        let mut read = 0usize;
        let mut dst = vec![0u8; 20_000];

        for _ in 0..500 {
            if rng.below(2) == 0 {
                let n = rng.below(9000);
                written += buf.write(&vec![0u8; n]);
            } else {
                let n = rng.below(dst.len());
                read += buf.read(&mut dst[..n]);
            }
            assert_eq!(buf.len(), written - read);
        }
    }

    #[test]
    fn test_single_chunk_retention() {
        let mut buf = isolated();
        let wr: Vec<u8> = b"helloworld".iter().copied().cycle().take(1000).collect();
        let wr_cnt = 4;
        let mut tmp = vec![0u8; wr.len() * wr_cnt];

        // 1: everything fits one chunk (4000 bytes); 3: spills over three
        for mult in [1, 3] {
            for _ in 0..3 {
                for _ in 0..mult * wr_cnt {
                    buf.write(&wr);
                }
                for _ in 0..mult {
                    buf.read(&mut tmp);
                }
                assert_eq!(buf.chunks(), 1);
                assert!(buf.is_empty());
            }
        }
    }

    #[test]
    fn test_small_cycles_never_touch_pool() {
        let mut buf = isolated();
        let mut dst = [0u8; 64];
        buf.write(b"warmup");
        buf.read(&mut dst);
        let created = buf.pool().created();

        for i in 0..10_000u32 {
            let msg = i.to_le_bytes();
            buf.write(&msg);
            assert_eq!(buf.read(&mut dst), 4);
            assert_eq!(&dst[..4], &msg);
        }
        assert_eq!(buf.pool().created(), created);
        assert_eq!(buf.chunks(), 1);
    }

    #[test]
    fn test_clean() {
        let mut buf = isolated();
        buf.clean();

        buf.write(&vec![3u8; CHUNK_SIZE * 100]);
        let mut dst = [0u8; 10];
        buf.read(&mut dst);
        buf.clean();

        assert_eq!(buf.len(), 0);
        assert_eq!(buf.chunks(), 0);
        assert_eq!(buf.pool().in_use(), 0);
        assert_eq!(buf.pool().available(), buf.pool().created());

        buf.write(b"again");
        assert_eq!(drain(&mut buf, 16), b"again");
    }

    #[test]
    fn test_random_sizes_across_cleans() {
        let mut rng = XorShift(42);
        let mut buf = isolated();

        for _stage in 0..3 {
            buf.clean();
            let mut plain = Vec::new();
            for i in 1..=100usize {
                let l = if rng.below(2) == 0 {
                    rng.below(256)
                } else {
                    (16 + rng.below(64)) * 1024 + rng.below(1024)
                };
                let data = vec![i as u8; l + 1];
                buf.write(&data);
                plain.extend_from_slice(&data);
            }
            assert_eq!(buf.len(), plain.len());
            let step = 1 + rng.below(20_000);
            assert_eq!(drain(&mut buf, step), plain);
        }
    }

    #[test]
    fn test_concurrent_buffers_share_pool_without_contamination() {
        let pool = Arc::new(ChunkPool::new());
        let mut handles = vec![];

        for worker in 0..4u64 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                let mut rng = XorShift(worker + 1);
                let mut buf = ChunkBuffer::with_pool(pool);
                let mut dst = vec![0u8; 3000];

                for iter in 0..2000usize {
                    let tag = (worker as u8) << 6 | (iter % 64) as u8;
                    let n = 16 + rng.below(6000);
                    buf.write(&vec![tag; n]);

                    let mut seen = 0;
                    loop {
                        let r = buf.read(&mut dst);
                        assert!(dst[..r].iter().all(|&b| b == tag), "cross-buffer bytes");
                        seen += r;
                        if r < dst.len() {
                            break;
                        }
                    }
                    assert_eq!(seen, n);

                    if rng.below(50) == 0 {
                        buf.clean();
                    }
                }
                buf.clean();
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.in_use(), 0);
    }
}
