//! `LibcSyscalls` - default `Syscalls` implementation.
//!
//! One libc call per method; a `-1` return becomes `Errno::last()`.
//! Stateless, so a single instance is shared by every poller.

use edgepoll_core::syscall::{SysResult, Syscalls};
use nix::errno::Errno;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Default, Clone, Copy)]
pub struct LibcSyscalls;

static SHARED: OnceLock<Arc<LibcSyscalls>> = OnceLock::new();

impl LibcSyscalls {
    /// Shared instance for callers that want an `Arc<dyn Syscalls>`.
    pub fn shared() -> Arc<LibcSyscalls> {
        SHARED.get_or_init(|| Arc::new(LibcSyscalls)).clone()
    }
}

fn to_sockaddr(addr: SocketAddrV4) -> libc::sockaddr_in {
    // Safety: sockaddr_in is plain old data; all-zero is a valid value
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sa
}

fn from_sockaddr(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
        u16::from_be(sa.sin_port),
    )
}

const SOCKADDR_IN_LEN: libc::socklen_t = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

impl Syscalls for LibcSyscalls {
    fn epoll_create1(&self, flags: i32) -> SysResult<RawFd> {
        Errno::result(unsafe { libc::epoll_create1(flags) })
    }

    fn epoll_ctl(
        &self,
        epfd: RawFd,
        op: i32,
        fd: RawFd,
        event: Option<&mut libc::epoll_event>,
    ) -> SysResult<()> {
        let ptr = event.map_or(std::ptr::null_mut(), |e| e as *mut libc::epoll_event);
        Errno::result(unsafe { libc::epoll_ctl(epfd, op, fd, ptr) }).map(drop)
    }

    fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [libc::epoll_event],
        timeout_ms: i32,
    ) -> SysResult<usize> {
        let max = events.len().min(i32::MAX as usize) as i32;
        let n = Errno::result(unsafe {
            libc::epoll_wait(epfd, events.as_mut_ptr(), max, timeout_ms)
        })?;
        Ok(n as usize)
    }

    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> SysResult<RawFd> {
        Errno::result(unsafe { libc::socket(domain, ty, protocol) })
    }

    fn set_nonblock(&self, fd: RawFd, nonblocking: bool) -> SysResult<()> {
        let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }).map(drop)
    }

    fn setsockopt_int(&self, fd: RawFd, level: i32, opt: i32, value: i32) -> SysResult<()> {
        Errno::result(unsafe {
            libc::setsockopt(
                fd,
                level,
                opt,
                &value as *const i32 as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        })
        .map(drop)
    }

    fn bind(&self, fd: RawFd, addr: SocketAddrV4) -> SysResult<()> {
        let sa = to_sockaddr(addr);
        Errno::result(unsafe {
            libc::bind(fd, &sa as *const libc::sockaddr_in as *const libc::sockaddr, SOCKADDR_IN_LEN)
        })
        .map(drop)
    }

    fn listen(&self, fd: RawFd, backlog: i32) -> SysResult<()> {
        Errno::result(unsafe { libc::listen(fd, backlog) }).map(drop)
    }

    fn accept(&self, fd: RawFd) -> SysResult<(RawFd, SocketAddrV4)> {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = SOCKADDR_IN_LEN;
        let client = Errno::result(unsafe {
            libc::accept4(
                fd,
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_CLOEXEC,
            )
        })?;
        Ok((client, from_sockaddr(&sa)))
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> SysResult<usize> {
        let n = Errno::result(unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        })?;
        Ok(n as usize)
    }

    fn close(&self, fd: RawFd) -> SysResult<()> {
        Errno::result(unsafe { libc::close(fd) }).map(drop)
    }

    fn local_addr(&self, fd: RawFd) -> SysResult<SocketAddrV4> {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = SOCKADDR_IN_LEN;
        Errno::result(unsafe {
            libc::getsockname(fd, &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr, &mut len)
        })?;
        Ok(from_sockaddr(&sa))
    }
}
