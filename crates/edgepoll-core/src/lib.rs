//! # edgepoll-core
//!
//! Platform-light building blocks for the edgepoll server:
//!
//! - `chunk` - fixed 4 KiB `Chunk` and the shared lock-free `ChunkPool`
//! - `chain` - `ChunkBuffer`, a FIFO byte stream over pooled chunks
//! - `syscall` - the `Syscalls` trait every kernel call goes through
//! - `error` - `NetError`, `SysOp`, `Result`
//! - `log` - leveled stderr logging macros
//!
//! The epoll poller, worker pool and server live in the `edgepoll` crate;
//! concrete `Syscalls` implementations live in `edgepoll-sys`.

pub mod chunk;
pub mod chain;
pub mod syscall;
pub mod error;
pub mod log;

// Re-exports for convenience
pub use chunk::{Chunk, ChunkPool};
pub use chain::ChunkBuffer;
pub use syscall::{SysResult, Syscalls};
pub use error::{Errno, NetError, Result, SysOp};

/// Sizing constants
pub mod constants {
    /// Bytes per pooled chunk
    pub const CHUNK_SIZE: usize = 4096;

    /// Default epoll event buffer capacity per poller
    pub const DEFAULT_EVENTS_CAPACITY: usize = 2048;

    /// Default listen(2) backlog
    pub const DEFAULT_LISTEN_BACKLOG: i32 = 2048;

    /// Per-worker read buffer (lives on the worker's stack)
    pub const READ_BUFFER_SIZE: usize = 32 * 1024;

    /// Initial process-wide epoll_wait timeout in milliseconds
    pub const DEFAULT_WAIT_TIMEOUT_MS: i32 = 100;
}
