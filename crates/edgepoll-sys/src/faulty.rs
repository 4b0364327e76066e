//! `FaultySyscalls` - fault-injecting `Syscalls` wrapper for tests.
//!
//! Delegates to an inner implementation until told to fail a call:
//!
//! ```ignore
//! let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
//! sys.fail_after(SysOp::EpollCreate, 1, Errno::EMFILE); // 2nd create fails
//! sys.fail(SysOp::Bind, Errno::EADDRINUSE);             // every bind fails
//! sys.fail_times(SysOp::EpollWait, 3, Errno::EINTR);     // next 3 waits fail
//! ```
//!
//! A failed call never reaches the inner implementation, so no kernel
//! resource is acquired by it. Every call, passed or failed, is counted.

use edgepoll_core::error::{Errno, SysOp};
use edgepoll_core::syscall::{SysResult, Syscalls};

use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const OPS: usize = SysOp::ALL.len();

#[derive(Debug, Clone, Copy, Default)]
struct Fault {
    errno: Option<Errno>,
    /// Calls still allowed through before `errno` kicks in.
    skips: usize,
    /// Failures left before the fault heals itself; `None` never heals.
    times: Option<usize>,
}

pub struct FaultySyscalls {
    inner: Arc<dyn Syscalls>,
    faults: Mutex<[Fault; OPS]>,
    calls: [AtomicUsize; OPS],
}

impl FaultySyscalls {
    pub fn new(inner: Arc<dyn Syscalls>) -> Self {
        Self {
            inner,
            faults: Mutex::new([Fault::default(); OPS]),
            calls: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    /// Fail every subsequent `op` with `errno`.
    pub fn fail(&self, op: SysOp, errno: Errno) {
        self.fail_after(op, 0, errno);
    }

    /// Let `skips` calls of `op` through, then fail with `errno`.
    pub fn fail_after(&self, op: SysOp, skips: usize, errno: Errno) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults[op as usize] = Fault { errno: Some(errno), skips, times: None };
    }

    /// Fail the next `times` calls of `op` with `errno`, then pass again.
    pub fn fail_times(&self, op: SysOp, times: usize, errno: Errno) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults[op as usize] = if times == 0 {
            Fault::default()
        } else {
            Fault { errno: Some(errno), skips: 0, times: Some(times) }
        };
    }

    /// Stop failing `op`.
    pub fn heal(&self, op: SysOp) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults[op as usize] = Fault::default();
    }

    pub fn heal_all(&self) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        *faults = [Fault::default(); OPS];
    }

    /// Number of times `op` was attempted, failed or not.
    pub fn calls(&self, op: SysOp) -> usize {
        self.calls[op as usize].load(Ordering::Relaxed)
    }

    fn gate(&self, op: SysOp) -> SysResult<()> {
        self.calls[op as usize].fetch_add(1, Ordering::Relaxed);
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        let fault = &mut faults[op as usize];
        match fault.errno {
            None => Ok(()),
            Some(_) if fault.skips > 0 => {
                fault.skips -= 1;
                Ok(())
            }
            Some(errno) => {
                if let Some(left) = fault.times.as_mut() {
                    *left -= 1;
                    if *left == 0 {
                        *fault = Fault::default();
                    }
                }
                Err(errno)
            }
        }
    }
}

impl Syscalls for FaultySyscalls {
    fn epoll_create1(&self, flags: i32) -> SysResult<RawFd> {
        self.gate(SysOp::EpollCreate)?;
        self.inner.epoll_create1(flags)
    }

    fn epoll_ctl(
        &self,
        epfd: RawFd,
        op: i32,
        fd: RawFd,
        event: Option<&mut libc::epoll_event>,
    ) -> SysResult<()> {
        self.gate(SysOp::EpollCtl)?;
        self.inner.epoll_ctl(epfd, op, fd, event)
    }

    fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [libc::epoll_event],
        timeout_ms: i32,
    ) -> SysResult<usize> {
        self.gate(SysOp::EpollWait)?;
        self.inner.epoll_wait(epfd, events, timeout_ms)
    }

    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> SysResult<RawFd> {
        self.gate(SysOp::Socket)?;
        self.inner.socket(domain, ty, protocol)
    }

    fn set_nonblock(&self, fd: RawFd, nonblocking: bool) -> SysResult<()> {
        self.gate(SysOp::SetNonblock)?;
        self.inner.set_nonblock(fd, nonblocking)
    }

    fn setsockopt_int(&self, fd: RawFd, level: i32, opt: i32, value: i32) -> SysResult<()> {
        self.gate(SysOp::SetSockOpt)?;
        self.inner.setsockopt_int(fd, level, opt, value)
    }

    fn bind(&self, fd: RawFd, addr: SocketAddrV4) -> SysResult<()> {
        self.gate(SysOp::Bind)?;
        self.inner.bind(fd, addr)
    }

    fn listen(&self, fd: RawFd, backlog: i32) -> SysResult<()> {
        self.gate(SysOp::Listen)?;
        self.inner.listen(fd, backlog)
    }

    fn accept(&self, fd: RawFd) -> SysResult<(RawFd, SocketAddrV4)> {
        self.gate(SysOp::Accept)?;
        self.inner.accept(fd)
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> SysResult<usize> {
        self.gate(SysOp::Read)?;
        self.inner.read(fd, buf)
    }

    fn close(&self, fd: RawFd) -> SysResult<()> {
        self.gate(SysOp::Close)?;
        self.inner.close(fd)
    }

    fn local_addr(&self, fd: RawFd) -> SysResult<SocketAddrV4> {
        self.gate(SysOp::GetSockName)?;
        self.inner.local_addr(fd)
    }
}
