//! `TcpServer` - listening socket, acceptor loop, worker pool.
//!
//! Lifecycle:
//!
//! ```text
//!   bind ──► start (blocks, accepting) ──► close ──► start returns Ok
//!              │                             │
//!              └─ hands each client to the   └─ workers see the flag within
//!                 next live worker              one wait timeout and exit
//! ```

use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::poller::{Poller, PollerHandle};
use crate::worker::{Shared, WorkerPool, WorkerStats};

use edgepoll_core::error::{Errno, NetError, Result, SysOp};
use edgepoll_core::syscall::Syscalls;
use edgepoll_core::{log_debug, log_error, log_info, log_warn};
use edgepoll_sys::LibcSyscalls;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;

/// Bind `addr:port` with default configuration and the libc syscalls.
///
/// An empty `addr` means every local IPv4 address; port 0 picks an
/// ephemeral port (see [`TcpServer::local_addr`]).
pub fn new_server(addr: &str, port: u16) -> Result<TcpServer> {
    TcpServer::bind(addr, port, ServerConfig::default(), LibcSyscalls::shared())
}

pub struct TcpServer {
    sys: Arc<dyn Syscalls>,
    /// -1 once released; only changes under the acceptor lock
    listen_fd: AtomicI32,
    local_addr: SocketAddrV4,
    acceptor: Mutex<Poller>,
    acceptor_handle: PollerHandle,
    workers: WorkerPool,
    shared: Arc<Shared>,
}

fn parse_ipv4(addr: &str) -> Result<Ipv4Addr> {
    if addr.is_empty() {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    addr.parse()
        .map_err(|_| NetError::InvalidAddress(addr.to_string()))
}

/// socket → O_NONBLOCK → SO_REUSEADDR → TCP_NODELAY → TCP_QUICKACK → bind
/// → listen. Closes the socket if any step fails.
fn open_listener(sys: &dyn Syscalls, addr: SocketAddrV4, backlog: i32) -> Result<RawFd> {
    let fd = sys
        .socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
        .map_err(NetError::os(SysOp::Socket))?;

    let configure = || -> Result<()> {
        sys.set_nonblock(fd, true)
            .map_err(NetError::os(SysOp::SetNonblock))?;
        sys.setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
            .map_err(NetError::os(SysOp::SetSockOpt))?;
        sys.setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
            .map_err(NetError::os(SysOp::SetSockOpt))?;
        sys.setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_QUICKACK, 1)
            .map_err(NetError::os(SysOp::SetSockOpt))?;
        sys.bind(fd, addr).map_err(NetError::os(SysOp::Bind))?;
        sys.listen(fd, backlog).map_err(NetError::os(SysOp::Listen))?;
        Ok(())
    };

    if let Err(e) = configure() {
        let _ = sys.close(fd);
        return Err(e);
    }
    Ok(fd)
}

impl TcpServer {
    /// Validate `config`, open the listening socket, the acceptor poller
    /// and the worker pool. Fails fast; whatever was acquired before the
    /// failure is released.
    pub fn bind(addr: &str, port: u16, config: ServerConfig, sys: Arc<dyn Syscalls>) -> Result<Self> {
        config.validate()?;
        let ip = parse_ipv4(addr)?;

        let fd = open_listener(&*sys, SocketAddrV4::new(ip, port), config.listen_backlog)?;

        let setup = || -> Result<(SocketAddrV4, Poller, WorkerPool, Arc<Shared>)> {
            let local_addr = sys.local_addr(fd).map_err(NetError::os(SysOp::GetSockName))?;
            let mut acceptor = Poller::server(sys.clone(), config.events_capacity, fd)?;
            acceptor.set_timeout_ms(config.effective_wait_timeout());
            let shared = Arc::new(Shared::new());
            let workers = WorkerPool::start(sys.clone(), &config, shared.clone())?;
            Ok((local_addr, acceptor, workers, shared))
        };

        let (local_addr, acceptor, workers, shared) = match setup() {
            Ok(parts) => parts,
            Err(e) => {
                let _ = sys.close(fd);
                return Err(e);
            }
        };

        log_info!(
            "listening on {} (fd={}, {} workers, timeout {}ms)",
            local_addr,
            fd,
            workers.len(),
            acceptor.timeout_ms()
        );

        Ok(Self {
            sys,
            listen_fd: AtomicI32::new(fd),
            local_addr,
            acceptor_handle: acceptor.handle(),
            acceptor: Mutex::new(acceptor),
            workers,
            shared,
        })
    }

    /// The bound address, with the kernel-chosen port when bound to 0.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Install the read callback. Takes effect from the next wake of each
    /// worker.
    pub fn on_client_read<F>(&self, callback: F)
    where
        F: Fn(&mut Connection) -> bool + Send + Sync + 'static,
    {
        self.shared.set_callback(Arc::new(callback));
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Run the acceptor loop on the calling thread until `close()`.
    ///
    /// Returns `Ok(())` once closed, or the error that stopped accepting:
    /// a failed wait, an unexpected accept error, or `NoLiveWorkers`.
    pub fn start(&self) -> Result<()> {
        let mut acceptor = self.acceptor.lock().unwrap_or_else(|e| e.into_inner());
        let result = self.accept_loop(&mut acceptor);
        if self.shared.is_closed() {
            self.release_listener();
        }
        result
    }

    fn accept_loop(&self, acceptor: &mut Poller) -> Result<()> {
        loop {
            if self.shared.is_closed() {
                return Ok(());
            }

            match acceptor.wait() {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    thread::yield_now();
                    continue;
                }
                Err(e) => {
                    if self.shared.is_closed() {
                        return Ok(());
                    }
                    log_error!("acceptor poller failed: {}", e);
                    return Err(e);
                }
            }

            // also after a timeout, in case an edge was lost to EMFILE
            self.accept_pending()?;
        }
    }

    fn accept_pending(&self) -> Result<()> {
        loop {
            let fd = self.listen_fd.load(Ordering::Acquire);
            if fd < 0 || self.shared.is_closed() {
                return Ok(());
            }

            match self.sys.accept(fd) {
                Ok((client, peer)) => self.hand_off(client, peer)?,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::ECONNABORTED | Errno::EPROTO | Errno::EINTR) => continue,
                Err(errno @ (Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM)) => {
                    log_warn!("accept: {}, retrying on next wake", errno);
                    return Ok(());
                }
                Err(errno) => {
                    if self.shared.is_closed() {
                        return Ok(());
                    }
                    log_error!("accept failed: {}", errno);
                    return Err(NetError::Syscall { op: SysOp::Accept, errno });
                }
            }
        }
    }

    fn hand_off(&self, client: RawFd, peer: SocketAddrV4) -> Result<()> {
        match self.workers.dispatch(Connection::new(client, peer)) {
            Ok(worker) => {
                log_debug!("fd={} peer={} -> worker {}", client, peer, worker);
                Ok(())
            }
            Err(NetError::NoLiveWorkers) => {
                let _ = self.sys.close(client);
                log_error!("no live workers, dropping fd={} peer={}", client, peer);
                Err(NetError::NoLiveWorkers)
            }
            Err(e) => {
                log_warn!("fd={} peer={} not registered: {}", client, peer, e);
                let _ = self.sys.close(client);
                Ok(())
            }
        }
    }

    /// Stop accepting and tell the workers to stop. Idempotent.
    ///
    /// `start()` returns within one wait timeout; use `join_workers()` to
    /// wait for the workers themselves. The listening descriptor is only
    /// closed while holding the acceptor: here if no `start()` is running,
    /// otherwise by `start()` on its way out.
    pub fn close(&self) {
        if self.shared.close() {
            return;
        }

        match self.acceptor.try_lock() {
            Ok(_acceptor) => self.release_listener(),
            Err(TryLockError::Poisoned(poisoned)) => {
                let _acceptor = poisoned.into_inner();
                self.release_listener();
            }
            Err(TryLockError::WouldBlock) => {}
        }
        log_info!("server on {} closed", self.local_addr);
    }

    /// Deregister and close the listening descriptor. Callers hold the
    /// acceptor lock (or `&mut self`), so no accept can race the close.
    fn release_listener(&self) {
        let fd = self.listen_fd.swap(-1, Ordering::AcqRel);
        if fd < 0 {
            return;
        }
        if let Err(e) = self.acceptor_handle.delete_fd(fd) {
            log_debug!("deregister listener fd={}: {}", fd, e);
        }
        if let Err(errno) = self.sys.close(fd) {
            log_warn!("close listener fd={}: {}", fd, errno);
        }
    }

    /// Per-worker counters.
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers.stats()
    }

    pub fn live_workers(&self) -> usize {
        self.workers.live_workers()
    }

    /// Wait for every worker and collect its result. Blocks until the
    /// workers exit, which they do after `close()` or a poller failure.
    pub fn join_workers(&self) -> Vec<Result<()>> {
        self.workers.join()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
        self.release_listener();
        for (id, result) in self.workers.join().into_iter().enumerate() {
            if let Err(e) = result {
                log_debug!("worker {} exited with: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgepoll_sys::FaultySyscalls;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn config(workers: usize) -> ServerConfig {
        ServerConfig::new().workers(workers).events_capacity(64).wait_timeout_ms(10)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn running(server: TcpServer) -> (Arc<TcpServer>, thread::JoinHandle<Result<()>>) {
        let server = Arc::new(server);
        let s = server.clone();
        let acceptor = thread::spawn(move || s.start());
        (server, acceptor)
    }

    #[test]
    fn test_wildcard_ephemeral_bind() {
        let server = new_server("", 0).unwrap();
        assert_eq!(*server.local_addr().ip(), Ipv4Addr::UNSPECIFIED);
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.live_workers() >= 1);
    }

    #[test]
    fn test_invalid_address() {
        for addr in ["not-an-ip", "::1", "256.0.0.1", "127.0.0.1:80"] {
            match new_server(addr, 0) {
                Err(NetError::InvalidAddress(a)) => assert_eq!(a, addr),
                Err(e) => panic!("{}: unexpected error {}", addr, e),
                Ok(_) => panic!("{}: bound", addr),
            }
        }
    }

    #[test]
    fn test_zero_workers_rejected_before_socket() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        let err = TcpServer::bind("127.0.0.1", 0, config(0), sys.clone()).err().unwrap();
        assert_eq!(err, NetError::InvalidPoolSize(0));
        assert_eq!(sys.calls(SysOp::Socket), 0);
    }

    #[test]
    fn test_listen_failure_closes_socket() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        sys.fail(SysOp::Listen, Errno::EADDRINUSE);
        let err = TcpServer::bind("127.0.0.1", 0, config(1), sys.clone()).err().unwrap();
        assert_eq!(err, NetError::Syscall { op: SysOp::Listen, errno: Errno::EADDRINUSE });
        assert_eq!(sys.calls(SysOp::Socket), 1);
        assert_eq!(sys.calls(SysOp::Close), 1);
    }

    #[test]
    fn test_worker_poller_failure_rolls_back_listener_and_acceptor() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        sys.fail_after(SysOp::EpollCreate, 1, Errno::EMFILE);
        let err = TcpServer::bind("127.0.0.1", 0, config(2), sys.clone()).err().unwrap();
        assert_eq!(err.errno(), Some(Errno::EMFILE));
        // acceptor epoll fd + listening socket
        assert_eq!(sys.calls(SysOp::Close), 2);
    }

    #[test]
    fn test_end_to_end_callback() {
        let server = TcpServer::bind("127.0.0.1", 0, config(2), LibcSyscalls::shared()).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        server.on_client_read(move |conn| {
            let mut buf = Vec::new();
            let _ = conn.read_to_end(&mut buf);
            sink.lock().unwrap().extend_from_slice(&buf);
            true
        });
        let (server, acceptor) = running(server);

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.write_all(b"ping over edgepoll").unwrap();
        assert!(wait_until(|| received.lock().unwrap().as_slice() == b"ping over edgepoll"));

        server.close();
        assert_eq!(acceptor.join().unwrap(), Ok(()));
        assert!(server.join_workers().iter().all(|r| r.is_ok()));

        let stats = server.stats();
        assert_eq!(stats.iter().map(|s| s.bytes_read).sum::<u64>(), 18);
        assert_eq!(stats.iter().map(|s| s.declined).sum::<u64>(), 0);
    }

    #[test]
    fn test_clients_spread_round_robin() {
        let server = TcpServer::bind("127.0.0.1", 0, config(2), LibcSyscalls::shared()).unwrap();
        let (server, acceptor) = running(server);

        let clients: Vec<TcpStream> = (0..4)
            .map(|_| TcpStream::connect(server.local_addr()).unwrap())
            .collect();
        assert!(wait_until(|| server.stats().iter().all(|s| s.adopted == 2 && s.live == 2)));

        drop(clients);
        assert!(wait_until(|| server.stats().iter().all(|s| s.live == 0)));

        server.close();
        assert!(acceptor.join().unwrap().is_ok());
    }

    #[test]
    fn test_large_payload_arrives_intact() {
        let server = TcpServer::bind("127.0.0.1", 0, config(1), LibcSyscalls::shared()).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        server.on_client_read(move |conn| {
            sink.lock().unwrap().extend(conn.take_inbound());
            true
        });
        let (server, acceptor) = running(server);

        let payload: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.write_all(&payload).unwrap();

        assert!(wait_until(|| received.lock().unwrap().len() == payload.len()));
        assert_eq!(*received.lock().unwrap(), payload);

        server.close();
        assert!(acceptor.join().unwrap().is_ok());
    }

    #[test]
    fn test_registration_failure_closes_client() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        let server = TcpServer::bind("127.0.0.1", 0, config(1), sys.clone()).unwrap();
        sys.fail(SysOp::EpollCtl, Errno::ENOSPC);
        let (server, acceptor) = running(server);

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        assert!(wait_until(|| server.stats()[0].forgotten == 1));
        let s = server.stats()[0];
        assert_eq!((s.adopted, s.live, s.closed), (0, 0, 0));

        sys.heal_all();
        server.close();
        assert!(acceptor.join().unwrap().is_ok());
    }

    #[test]
    fn test_close_stops_start_and_is_idempotent() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        let server = TcpServer::bind("127.0.0.1", 0, config(1), sys.clone()).unwrap();
        let (server, acceptor) = running(server);

        thread::sleep(Duration::from_millis(30));
        server.close();
        assert_eq!(acceptor.join().unwrap(), Ok(()));
        assert!(server.is_closed());

        let closes = sys.calls(SysOp::Close);
        server.close();
        assert_eq!(sys.calls(SysOp::Close), closes);

        // a closed server returns from start immediately
        assert_eq!(server.start(), Ok(()));
        assert!(server.join_workers().iter().all(|r| r.is_ok()));
        assert_eq!(server.live_workers(), 0);
    }

    #[test]
    fn test_close_without_acceptor_releases_listener() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        let server = TcpServer::bind("127.0.0.1", 0, config(1), sys.clone()).unwrap();
        let closes = sys.calls(SysOp::Close);
        server.close();
        assert_eq!(sys.calls(SysOp::Close), closes + 1);
        assert_eq!(server.listen_fd.load(Ordering::Acquire), -1);
        assert!(TcpStream::connect(server.local_addr()).is_err());
    }

    #[test]
    fn test_listener_outlives_close_while_acceptor_runs() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        let server = TcpServer::bind("127.0.0.1", 0, config(1), sys.clone()).unwrap();
        let fd = server.listen_fd.load(Ordering::Acquire);

        {
            // held the way a running start() holds it
            let _acceptor = server.acceptor.lock().unwrap();
            let closes = sys.calls(SysOp::Close);
            server.close();
            assert_eq!(sys.calls(SysOp::Close), closes);
            assert_eq!(server.listen_fd.load(Ordering::Acquire), fd);
            assert_eq!(sys.local_addr(fd), Ok(server.local_addr()));
        }

        let closes = sys.calls(SysOp::Close);
        assert_eq!(server.start(), Ok(()));
        assert_eq!(sys.calls(SysOp::Close), closes + 1);
        assert_eq!(server.listen_fd.load(Ordering::Acquire), -1);
        assert!(TcpStream::connect(server.local_addr()).is_err());
    }

    #[test]
    fn test_interrupted_acceptor_keeps_accepting() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        let server = TcpServer::bind("127.0.0.1", 0, config(1), sys.clone()).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        server.on_client_read(move |conn| {
            sink.lock().unwrap().extend(conn.take_inbound());
            true
        });
        sys.fail_times(SysOp::EpollWait, 20, Errno::EINTR);
        let (server, acceptor) = running(server);

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.write_all(b"after eintr").unwrap();
        assert!(wait_until(|| received.lock().unwrap().as_slice() == b"after eintr"));
        assert!(sys.calls(SysOp::EpollWait) > 20);
        assert!(!acceptor.is_finished());

        server.close();
        assert_eq!(acceptor.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_acceptor_wait_failure_ends_start() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        let server = TcpServer::bind("127.0.0.1", 0, config(1), sys.clone()).unwrap();
        sys.fail(SysOp::EpollWait, Errno::EBADF);

        let err = server.start().unwrap_err();
        assert_eq!(err, NetError::Syscall { op: SysOp::EpollWait, errno: Errno::EBADF });
        assert!(!server.is_closed());
        // not closed, so the listener stays open
        assert!(server.listen_fd.load(Ordering::Acquire) >= 0);
        sys.heal_all();
    }

    #[test]
    fn test_aborted_accept_continues_the_drain() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        let server = TcpServer::bind("127.0.0.1", 0, config(1), sys.clone()).unwrap();
        let _client = TcpStream::connect(server.local_addr()).unwrap();

        sys.fail_times(SysOp::Accept, 1, Errno::ECONNABORTED);
        assert_eq!(server.accept_pending(), Ok(()));
        // aborted, accepted, EAGAIN
        assert_eq!(sys.calls(SysOp::Accept), 3);
        assert!(wait_until(|| server.stats()[0].live == 1));
    }

    #[test]
    fn test_fd_exhaustion_defers_accept_to_next_wake() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        let server = TcpServer::bind("127.0.0.1", 0, config(1), sys.clone()).unwrap();
        let _client = TcpStream::connect(server.local_addr()).unwrap();

        sys.fail_times(SysOp::Accept, 1, Errno::EMFILE);
        assert_eq!(server.accept_pending(), Ok(()));
        assert_eq!(sys.calls(SysOp::Accept), 1);
        assert_eq!(server.stats()[0].adopted, 0);

        assert_eq!(server.accept_pending(), Ok(()));
        assert!(wait_until(|| server.stats()[0].live == 1));
    }

    #[test]
    fn test_unexpected_accept_error_is_returned_until_closed() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        let server = TcpServer::bind("127.0.0.1", 0, config(1), sys.clone()).unwrap();
        sys.fail(SysOp::Accept, Errno::EINVAL);

        assert_eq!(
            server.accept_pending(),
            Err(NetError::Syscall { op: SysOp::Accept, errno: Errno::EINVAL })
        );
        server.close();
        assert_eq!(server.accept_pending(), Ok(()));
        sys.heal_all();
    }

    #[test]
    fn test_no_live_workers_ends_start() {
        let sys = Arc::new(FaultySyscalls::new(LibcSyscalls::shared()));
        let server = TcpServer::bind("127.0.0.1", 0, config(2), sys.clone()).unwrap();
        sys.fail(SysOp::EpollWait, Errno::EBADF);
        assert!(wait_until(|| server.live_workers() == 0));
        sys.heal_all();

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        assert_eq!(server.start(), Err(NetError::NoLiveWorkers));

        // the unplaced client was closed
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
