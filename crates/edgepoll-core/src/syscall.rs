//! Kernel call seam.
//!
//! Every kernel call the poller and server make goes through a `Syscalls`
//! object handed to their constructors. Production code uses the libc
//! implementation; tests swap in a wrapper that fails chosen calls on
//! demand, so rollback and error paths run deterministically without
//! exhausting real kernel resources.
//!
//! # Implementors
//!
//! - `LibcSyscalls` (edgepoll-sys, default): thin `libc` wrappers,
//!   `-1` converted to `Errno::last()`.
//!
//! - `FaultySyscalls` (edgepoll-sys, testing): delegates to an inner
//!   implementation and fails selected calls with a chosen errno, after
//!   an optional number of successful pass-through calls.

use crate::error::Errno;

use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;

/// Result of a single kernel call.
pub type SysResult<T> = std::result::Result<T, Errno>;

/// The kernel surface used by edgepoll.
///
/// **Contract:**
/// - Methods map one-to-one onto kernel calls; no retries inside.
/// - Failures return the raw errno; callers attach context.
/// - Implementations are shared across the acceptor and all workers,
///   so they must be `Send + Sync`.
pub trait Syscalls: Send + Sync {
    /// `epoll_create1(flags)`
    fn epoll_create1(&self, flags: i32) -> SysResult<RawFd>;

    /// `epoll_ctl(epfd, op, fd, event)`. `event` is `None` for `EPOLL_CTL_DEL`.
    fn epoll_ctl(
        &self,
        epfd: RawFd,
        op: i32,
        fd: RawFd,
        event: Option<&mut libc::epoll_event>,
    ) -> SysResult<()>;

    /// `epoll_wait` into `events`; returns the number of ready entries.
    fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [libc::epoll_event],
        timeout_ms: i32,
    ) -> SysResult<usize>;

    /// `socket(domain, ty, protocol)`
    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> SysResult<RawFd>;

    /// Toggle `O_NONBLOCK` via `fcntl`.
    fn set_nonblock(&self, fd: RawFd, nonblocking: bool) -> SysResult<()>;

    /// `setsockopt` with an `int` option value.
    fn setsockopt_int(&self, fd: RawFd, level: i32, opt: i32, value: i32) -> SysResult<()>;

    /// `bind` to an IPv4 address.
    fn bind(&self, fd: RawFd, addr: SocketAddrV4) -> SysResult<()>;

    /// `listen(fd, backlog)`
    fn listen(&self, fd: RawFd, backlog: i32) -> SysResult<()>;

    /// `accept4(fd, .., SOCK_CLOEXEC)`; returns the client fd and peer.
    fn accept(&self, fd: RawFd) -> SysResult<(RawFd, SocketAddrV4)>;

    /// `read(fd, buf)`
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> SysResult<usize>;

    /// `close(fd)`
    fn close(&self, fd: RawFd) -> SysResult<()>;

    /// `getsockname` for an IPv4 socket.
    fn local_addr(&self, fd: RawFd) -> SysResult<SocketAddrV4>;
}
