//! # Poller - one edge-triggered epoll instance
//!
//! A `Poller` owns the epoll fd's event buffer and is driven by exactly one
//! loop (the acceptor, or one worker). Registration goes through a
//! cloneable `PollerHandle`, so the acceptor can add descriptors to a
//! worker's epoll while that worker sits in `wait()`; `epoll_ctl` is safe
//! to call concurrently with `epoll_wait` on the same instance.
//!
//! The epoll fd is closed when the last `Poller`/`PollerHandle` drops.

use crate::config::default_wait_timeout;

use edgepoll_core::error::{NetError, Result, SysOp};
use edgepoll_core::syscall::Syscalls;

use std::os::unix::io::RawFd;
use std::sync::Arc;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLET: u32 = libc::EPOLLET as u32;

/// Interest set for the listening descriptor.
pub const READ_EDGE: u32 = EPOLLIN | EPOLLET;

/// Interest set for accepted client descriptors.
pub const CLIENT_EDGE: u32 = EPOLLIN | EPOLLRDHUP | EPOLLET;

/// One ready descriptor reported by the last `wait()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    fd: RawFd,
    mask: u32,
}

impl Event {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.mask & EPOLLIN != 0
    }

    /// Peer shut down its write side; whatever is buffered ends in EOF.
    #[inline]
    pub fn is_peer_shutdown(&self) -> bool {
        self.mask & EPOLLRDHUP != 0
    }

    #[inline]
    pub fn is_error_or_hangup(&self) -> bool {
        self.mask & (EPOLLERR | EPOLLHUP) != 0
    }
}

struct EpollFd {
    fd: RawFd,
    sys: Arc<dyn Syscalls>,
}

impl Drop for EpollFd {
    fn drop(&mut self) {
        let _ = self.sys.close(self.fd);
    }
}

/// Registration side of a poller. Cheap to clone; usable from any thread.
#[derive(Clone)]
pub struct PollerHandle {
    ep: Arc<EpollFd>,
}

impl PollerHandle {
    /// The epoll descriptor.
    pub fn fd(&self) -> RawFd {
        self.ep.fd
    }

    pub fn sys(&self) -> &Arc<dyn Syscalls> {
        &self.ep.sys
    }

    fn ctl(&self, op: i32, fd: RawFd, interest: Option<u32>) -> Result<()> {
        let ret = match interest {
            Some(events) => {
                let mut ev = libc::epoll_event { events, u64: fd as u64 };
                self.ep.sys.epoll_ctl(self.ep.fd, op, fd, Some(&mut ev))
            }
            None => self.ep.sys.epoll_ctl(self.ep.fd, op, fd, None),
        };
        ret.map_err(NetError::os(SysOp::EpollCtl))
    }

    /// Register `fd` with an explicit interest set.
    pub fn register(&self, fd: RawFd, interest: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(interest))
    }

    /// Replace the interest set of a registered `fd`.
    pub fn modify(&self, fd: RawFd, interest: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(interest))
    }

    /// Deregister `fd`. Fails with `ENOENT` if it was never registered here.
    pub fn delete_fd(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    /// Prepare an accepted socket and register it for edge-triggered reads.
    ///
    /// The descriptor is fully configured (non-blocking, `TCP_NODELAY`,
    /// `TCP_QUICKACK`) before registration, so a failure at any step
    /// leaves it unregistered and the caller only has to close it.
    pub fn add_client(&self, fd: RawFd) -> Result<()> {
        let sys = &self.ep.sys;
        sys.set_nonblock(fd, true)
            .map_err(NetError::os(SysOp::SetNonblock))?;
        sys.setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
            .map_err(NetError::os(SysOp::SetSockOpt))?;
        sys.setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_QUICKACK, 1)
            .map_err(NetError::os(SysOp::SetSockOpt))?;
        self.register(fd, CLIENT_EDGE)
    }
}

/// Wait side of a poller: the event buffer plus the timeout.
pub struct Poller {
    handle: PollerHandle,
    events: Vec<libc::epoll_event>,
    ready: usize,
    timeout_ms: i32,
}

impl Poller {
    /// Create an epoll instance with room for `capacity` events per wait.
    pub fn client(sys: Arc<dyn Syscalls>, capacity: usize) -> Result<Self> {
        let fd = sys
            .epoll_create1(libc::EPOLL_CLOEXEC)
            .map_err(NetError::os(SysOp::EpollCreate))?;

        Ok(Self {
            handle: PollerHandle { ep: Arc::new(EpollFd { fd, sys }) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            ready: 0,
            timeout_ms: default_wait_timeout(),
        })
    }

    /// Create an epoll instance watching `listen_fd` for edge-triggered
    /// readability. If registration fails the new epoll fd is closed.
    pub fn server(sys: Arc<dyn Syscalls>, capacity: usize, listen_fd: RawFd) -> Result<Self> {
        let poller = Self::client(sys, capacity)?;
        // on error `poller` drops here and closes its epoll fd
        poller.handle.register(listen_fd, READ_EDGE)?;
        Ok(poller)
    }

    pub fn handle(&self) -> PollerHandle {
        self.handle.clone()
    }

    pub fn fd(&self) -> RawFd {
        self.handle.fd()
    }

    pub fn sys(&self) -> &Arc<dyn Syscalls> {
        self.handle.sys()
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn timeout_ms(&self) -> i32 {
        self.timeout_ms
    }

    pub fn set_timeout_ms(&mut self, ms: i32) {
        self.timeout_ms = ms;
    }

    pub fn add_client(&self, fd: RawFd) -> Result<()> {
        self.handle.add_client(fd)
    }

    pub fn modify(&self, fd: RawFd, interest: u32) -> Result<()> {
        self.handle.modify(fd, interest)
    }

    pub fn delete_fd(&self, fd: RawFd) -> Result<()> {
        self.handle.delete_fd(fd)
    }

    /// Block up to the timeout for readiness. Returns the number of ready
    /// events (0 on timeout). `EINTR` comes back as an error; retry it.
    pub fn wait(&mut self) -> Result<usize> {
        self.ready = 0;
        let ep = &self.handle.ep;
        let n = ep
            .sys
            .epoll_wait(ep.fd, &mut self.events, self.timeout_ms)
            .map_err(NetError::os(SysOp::EpollWait))?;
        self.ready = n.min(self.events.len());
        Ok(self.ready)
    }

    /// Number of events from the last `wait()`.
    #[inline]
    pub fn ready(&self) -> usize {
        self.ready
    }

    /// The `i`-th event of the last `wait()`.
    #[inline]
    pub fn event(&self, i: usize) -> Event {
        let raw = self.events[..self.ready][i];
        Event { fd: raw.u64 as RawFd, mask: raw.events }
    }

    /// Events of the last `wait()`, in kernel order.
    pub fn events(&self) -> impl Iterator<Item = Event> + '_ {
        (0..self.ready).map(move |i| self.event(i))
    }
}
