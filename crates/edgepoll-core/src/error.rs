//! Error types for the edgepoll server core

use core::fmt;

pub use nix::errno::Errno;

/// Result type for edgepoll operations
pub type Result<T> = std::result::Result<T, NetError>;

/// The kernel call that produced an errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SysOp {
    EpollCreate,
    EpollCtl,
    EpollWait,
    Socket,
    SetNonblock,
    SetSockOpt,
    Bind,
    Listen,
    Accept,
    Read,
    Close,
    GetSockName,
}

impl SysOp {
    /// Every op, in declaration order. Index with `op as usize`.
    pub const ALL: [SysOp; 12] = [
        SysOp::EpollCreate,
        SysOp::EpollCtl,
        SysOp::EpollWait,
        SysOp::Socket,
        SysOp::SetNonblock,
        SysOp::SetSockOpt,
        SysOp::Bind,
        SysOp::Listen,
        SysOp::Accept,
        SysOp::Read,
        SysOp::Close,
        SysOp::GetSockName,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SysOp::EpollCreate => "epoll_create1",
            SysOp::EpollCtl => "epoll_ctl",
            SysOp::EpollWait => "epoll_wait",
            SysOp::Socket => "socket",
            SysOp::SetNonblock => "fcntl(O_NONBLOCK)",
            SysOp::SetSockOpt => "setsockopt",
            SysOp::Bind => "bind",
            SysOp::Listen => "listen",
            SysOp::Accept => "accept4",
            SysOp::Read => "read",
            SysOp::Close => "close",
            SysOp::GetSockName => "getsockname",
        }
    }
}

impl fmt::Display for SysOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors surfaced by construction and by the accept/worker loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Listen address is not an IPv4 literal
    InvalidAddress(String),

    /// Worker pool size must be at least 1
    InvalidPoolSize(usize),

    /// A kernel call failed
    Syscall { op: SysOp, errno: Errno },

    /// Failed to spawn a worker thread
    Spawn(String),

    /// Every worker loop has terminated; nothing can take new connections
    NoLiveWorkers,

    /// A worker thread panicked instead of returning
    WorkerPanicked(usize),
}

impl NetError {
    /// Adapter for `map_err`: tags an errno with the call that produced it.
    #[inline]
    pub fn os(op: SysOp) -> impl Fn(Errno) -> NetError {
        move |errno| NetError::Syscall { op, errno }
    }

    /// The errno behind this error, if it came from the kernel.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            NetError::Syscall { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// True for conditions the caller should simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(self.errno(), Some(Errno::EINTR) | Some(Errno::EAGAIN))
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::InvalidAddress(addr) => write!(f, "invalid IPv4 listen address: {:?}", addr),
            NetError::InvalidPoolSize(n) => write!(f, "invalid worker pool size: {}", n),
            NetError::Syscall { op, errno } => write!(f, "{} failed: {}", op, errno),
            NetError::Spawn(msg) => write!(f, "failed to spawn worker thread: {}", msg),
            NetError::NoLiveWorkers => write!(f, "no live worker pollers"),
            NetError::WorkerPanicked(id) => write!(f, "worker {} panicked", id),
        }
    }
}

impl std::error::Error for NetError {}
