//! `WorkerPool` - N worker pollers, one OS thread each.
//!
//! ```text
//!   acceptor ──Adopt(conn)──► inbox[i] ──┐
//!      │                                 ▼
//!      └──add_client(fd)──► epoll[i] ─► worker i ─► conns[i] ─► on_read(conn)
//! ```
//!
//! Each worker owns its shard of the connection table outright. The
//! acceptor never touches a shard: it pushes `Adopt` onto the worker's
//! lock-free inbox *before* registering the descriptor, so by the time the
//! worker sees the first event for an fd the connection is already queued.
//! If registration fails the acceptor pushes `Forget` and closes the fd.
//!
//! Workers are not restarted. A worker whose `wait()` fails marks itself
//! dead, closes every connection it owns and returns the error; dispatch
//! skips dead workers from then on. A worker is marked dead before its
//! final inbox drain, and dispatch re-checks liveness after pushing, so a
//! hand-off racing the drain is either drained by the worker or taken back
//! by dispatch.

use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::poller::{Event, Poller, PollerHandle};

use edgepoll_core::constants::READ_BUFFER_SIZE;
use edgepoll_core::error::{Errno, NetError, Result};
use edgepoll_core::syscall::Syscalls;
use edgepoll_core::{log_debug, log_error, log_info, log_trace, log_warn};

use crossbeam_queue::SegQueue;
use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

/// Read callback. The return value is recorded in the `declined` counter
/// and otherwise ignored.
pub type ReadCallback = Arc<dyn Fn(&mut Connection) -> bool + Send + Sync>;

/// Acceptor → worker message.
pub enum Handoff {
    /// Take ownership; the fd is (about to be) registered on your poller.
    Adopt(Connection),
    /// Registration of this fd failed and the acceptor closed it.
    Forget(RawFd),
}

/// State shared by the acceptor, every worker and the server handle.
pub struct Shared {
    closed: AtomicBool,
    on_read: RwLock<Option<ReadCallback>>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            on_read: RwLock::new(None),
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Raise the closed flag. Returns true if it was already raised.
    pub fn close(&self) -> bool {
        self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn set_callback(&self, cb: ReadCallback) {
        let mut slot = self.on_read.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(cb);
    }

    /// Snapshot of the current callback.
    pub fn callback(&self) -> Option<ReadCallback> {
        self.on_read.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct WorkerCounters {
    adopted: AtomicU64,
    forgotten: AtomicU64,
    closed: AtomicU64,
    bytes_read: AtomicU64,
    callbacks: AtomicU64,
    declined: AtomicU64,
    live: AtomicUsize,
}

/// Point-in-time counters for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub id: usize,
    pub alive: bool,
    /// Connections handed to this worker and registered on its poller
    pub adopted: u64,
    /// Hand-offs withdrawn because registration failed
    pub forgotten: u64,
    /// Owned connections closed by peer shutdown, read error, hang-up or shutdown
    pub closed: u64,
    pub bytes_read: u64,
    /// Read callback invocations
    pub callbacks: u64,
    /// Invocations that returned false
    pub declined: u64,
    /// Connections currently owned
    pub live: usize,
}

/// The part of a worker the acceptor can see.
struct WorkerState {
    id: usize,
    inbox: SegQueue<Handoff>,
    alive: AtomicBool,
    counters: WorkerCounters,
}

impl WorkerState {
    fn stats(&self) -> WorkerStats {
        let c = &self.counters;
        WorkerStats {
            id: self.id,
            alive: self.alive.load(Ordering::Acquire),
            adopted: c.adopted.load(Ordering::Relaxed),
            forgotten: c.forgotten.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
            bytes_read: c.bytes_read.load(Ordering::Relaxed),
            callbacks: c.callbacks.load(Ordering::Relaxed),
            declined: c.declined.load(Ordering::Relaxed),
            live: c.live.load(Ordering::Relaxed),
        }
    }
}

struct WorkerSlot {
    state: Arc<WorkerState>,
    poller: PollerHandle,
    thread: Mutex<Option<thread::JoinHandle<Result<()>>>>,
}

/// What `WorkerSlot::reclaim` found of one hand-off.
struct Reclaimed {
    /// The `Adopt`, if the worker never popped it
    conn: Option<Connection>,
    /// Whether the matching `Forget` was still queued
    forget: bool,
}

impl WorkerSlot {
    #[inline]
    fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::Acquire)
    }

    /// Empty the inbox of a dead worker. Queued connections other than
    /// `fd` are closed here, except those with a queued `Forget`, whose fd
    /// belongs to the dispatcher that pushed it.
    fn reclaim(&self, fd: RawFd) -> Reclaimed {
        let mut msgs = Vec::new();
        while let Some(msg) = self.state.inbox.pop() {
            msgs.push(msg);
        }
        let forgotten: HashSet<RawFd> = msgs
            .iter()
            .filter_map(|msg| match msg {
                Handoff::Forget(fd) => Some(*fd),
                Handoff::Adopt(_) => None,
            })
            .collect();

        let mut conn = None;
        for msg in msgs {
            let Handoff::Adopt(mut queued) = msg else {
                continue;
            };
            if queued.fd() == fd {
                conn = Some(queued);
                continue;
            }
            queued.clean();
            if forgotten.contains(&queued.fd()) {
                continue;
            }
            log_debug!("worker {} dead, closing queued fd={}", self.state.id, queued.fd());
            let _ = self.poller.delete_fd(queued.fd());
            if let Err(errno) = self.poller.sys().close(queued.fd()) {
                log_warn!("worker {} fd={} close: {}", self.state.id, queued.fd(), errno);
            }
        }

        Reclaimed { conn, forget: forgotten.contains(&fd) }
    }
}

pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Create `config.workers` client pollers and start one named thread
    /// per poller.
    ///
    /// On failure everything acquired so far is released: unspawned
    /// pollers close their epoll fds on drop, and already running workers
    /// are stopped through `shared` and joined.
    pub fn start(sys: Arc<dyn Syscalls>, config: &ServerConfig, shared: Arc<Shared>) -> Result<Self> {
        config.validate()?;

        let mut pollers = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let mut poller = Poller::client(sys.clone(), config.events_capacity)?;
            poller.set_timeout_ms(config.effective_wait_timeout());
            pollers.push(poller);
        }

        let mut pool = Self {
            slots: Vec::with_capacity(pollers.len()),
            next: AtomicUsize::new(0),
        };

        for (id, poller) in pollers.into_iter().enumerate() {
            let state = Arc::new(WorkerState {
                id,
                inbox: SegQueue::new(),
                alive: AtomicBool::new(true),
                counters: WorkerCounters::default(),
            });
            let handle = poller.handle();
            let worker = Worker {
                state: state.clone(),
                shared: shared.clone(),
                sys: sys.clone(),
                poller,
                conns: HashMap::new(),
            };

            let spawned = thread::Builder::new()
                .name(format!("edgepoll-worker-{}", id))
                .spawn(move || worker.run());

            match spawned {
                Ok(thread) => pool.slots.push(WorkerSlot {
                    state,
                    poller: handle,
                    thread: Mutex::new(Some(thread)),
                }),
                Err(e) => {
                    log_error!("failed to spawn worker {}: {}", id, e);
                    shared.close();
                    pool.join();
                    return Err(NetError::Spawn(e.to_string()));
                }
            }
        }

        log_debug!("started {} worker pollers", pool.slots.len());
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn live_workers(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.is_alive())
            .count()
    }

    /// Hand `conn` to the next live worker in round-robin order and
    /// register its fd there. Returns the chosen worker's index; from then
    /// on that worker owns the fd.
    ///
    /// On a registration error the worker is told to forget the
    /// connection; closing the fd is left to the caller. Hand-offs are
    /// expected from one thread at a time (the acceptor).
    pub fn dispatch(&self, mut conn: Connection) -> Result<usize> {
        let n = self.slots.len();
        for _ in 0..n {
            let i = self.next.fetch_add(1, Ordering::Relaxed) % n;
            let slot = &self.slots[i];
            if !slot.is_alive() {
                continue;
            }

            let fd = conn.fd();
            slot.state.inbox.push(Handoff::Adopt(conn));
            let registered = slot.poller.add_client(fd);
            if registered.is_err() {
                slot.state.inbox.push(Handoff::Forget(fd));
            }

            // pairs with the fence in Worker::run before its final drain
            fence(Ordering::SeqCst);
            if slot.is_alive() {
                return registered.map(|()| i);
            }

            let reclaimed = slot.reclaim(fd);
            match (reclaimed.conn, registered) {
                (Some(back), Ok(())) => {
                    log_debug!("worker {} died during hand-off of fd={}, retrying", i, fd);
                    let _ = slot.poller.delete_fd(fd);
                    conn = back;
                }
                (Some(mut back), Err(e)) => {
                    back.clean();
                    return Err(e);
                }
                // the worker drained both messages; the fd is still ours
                (None, Err(e)) if !reclaimed.forget => return Err(e),
                // the worker drained the Adopt and closes the fd itself
                (None, _) => return Ok(i),
            }
        }
        Err(NetError::NoLiveWorkers)
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.slots.iter().map(|s| s.state.stats()).collect()
    }

    /// Wait for every worker thread and collect its result. A worker
    /// already joined reports `Ok(())`.
    pub fn join(&self) -> Vec<Result<()>> {
        self.slots
            .iter()
            .map(|slot| {
                let thread = slot.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
                match thread {
                    Some(t) => t
                        .join()
                        .unwrap_or(Err(NetError::WorkerPanicked(slot.state.id))),
                    None => Ok(()),
                }
            })
            .collect()
    }
}

/// Marks the worker dead however `run` exits, panics included.
struct AliveGuard(Arc<WorkerState>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::Release);
    }
}

struct Worker {
    state: Arc<WorkerState>,
    shared: Arc<Shared>,
    sys: Arc<dyn Syscalls>,
    poller: Poller,
    conns: HashMap<RawFd, Connection>,
}

impl Worker {
    fn run(mut self) -> Result<()> {
        let _alive = AliveGuard(self.state.clone());
        let mut buf = [0u8; READ_BUFFER_SIZE];

        let result = loop {
            if self.shared.is_closed() {
                break Ok(());
            }

            match self.poller.wait() {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    thread::yield_now();
                    continue;
                }
                Err(e) => {
                    log_error!("worker {} poller failed: {}", self.state.id, e);
                    break Err(e);
                }
            }

            self.adopt_pending();

            let ready = self.poller.ready();
            if ready == 0 {
                continue;
            }
            let callback = self.shared.callback();
            for i in 0..ready {
                let ev = self.poller.event(i);
                self.handle_event(ev, &mut buf, callback.as_ref());
            }
        };

        self.state.alive.store(false, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        self.shutdown();
        result
    }

    fn handle_event(&mut self, ev: Event, buf: &mut [u8], callback: Option<&ReadCallback>) {
        let fd = ev.fd();
        if log_enabled_trace() {
            log_trace!("worker {} event fd={} mask={:#x}", self.state.id, fd, ev.mask());
        }

        if ev.is_readable() && !self.read_ready(fd, buf, ev.is_peer_shutdown(), callback) {
            return;
        }
        if ev.is_error_or_hangup() {
            self.close(fd);
        }
    }

    /// Edge-triggered drain. Keeps reading while reads fill `buf` (or, once
    /// the peer has shut down, until EOF). Returns false if `fd` was closed.
    fn read_ready(
        &mut self,
        fd: RawFd,
        buf: &mut [u8],
        until_eof: bool,
        callback: Option<&ReadCallback>,
    ) -> bool {
        loop {
            match self.sys.read(fd, buf) {
                Ok(0) => {
                    log_debug!("worker {} fd={} peer closed", self.state.id, fd);
                    self.close(fd);
                    return false;
                }
                Ok(n) => {
                    let counters = &self.state.counters;
                    counters.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                    if let Some(conn) = self.conns.get_mut(&fd) {
                        conn.inbound_mut().write(&buf[..n]);
                        deliver(&self.state, conn, callback);
                    }
                    if n < buf.len() && !until_eof {
                        return true;
                    }
                }
                Err(Errno::EAGAIN) => return true,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    log_debug!("worker {} fd={} read failed: {}", self.state.id, fd, errno);
                    self.close(fd);
                    return false;
                }
            }
        }
    }

    /// Drop the connection (if any), deregister and close `fd`.
    fn close(&mut self, fd: RawFd) {
        if let Some(mut conn) = self.conns.remove(&fd) {
            conn.clean();
            self.state.counters.live.fetch_sub(1, Ordering::Relaxed);
            self.state.counters.closed.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(e) = self.poller.delete_fd(fd) {
            log_debug!("worker {} fd={} deregister: {}", self.state.id, fd, e);
        }
        if let Err(errno) = self.sys.close(fd) {
            log_warn!("worker {} fd={} close: {}", self.state.id, fd, errno);
        }
    }

    fn adopt_pending(&mut self) {
        while let Some(msg) = self.state.inbox.pop() {
            let counters = &self.state.counters;
            match msg {
                Handoff::Adopt(conn) => {
                    log_debug!(
                        "worker {} adopted fd={} peer={}",
                        self.state.id,
                        conn.fd(),
                        conn.peer_addr()
                    );
                    counters.adopted.fetch_add(1, Ordering::Relaxed);
                    counters.live.fetch_add(1, Ordering::Relaxed);
                    if let Some(mut stale) = self.conns.insert(conn.fd(), conn) {
                        stale.clean();
                        counters.live.fetch_sub(1, Ordering::Relaxed);
                    }
                }
                Handoff::Forget(fd) => {
                    // the fd is the acceptor's to close
                    if let Some(mut conn) = self.conns.remove(&fd) {
                        conn.clean();
                        counters.adopted.fetch_sub(1, Ordering::Relaxed);
                        counters.live.fetch_sub(1, Ordering::Relaxed);
                        counters.forgotten.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Close everything this worker owns, including hand-offs not yet
    /// adopted.
    fn shutdown(&mut self) {
        self.adopt_pending();
        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        let n = fds.len();
        for fd in fds {
            self.close(fd);
        }
        log_info!("worker {} stopped, closed {} connections", self.state.id, n);
    }
}

fn deliver(state: &WorkerState, conn: &mut Connection, callback: Option<&ReadCallback>) {
    let Some(cb) = callback else {
        return;
    };
    state.counters.callbacks.fetch_add(1, Ordering::Relaxed);
    if !cb(conn) {
        state.counters.declined.fetch_add(1, Ordering::Relaxed);
        log_debug!("worker {} fd={} callback declined", state.id, conn.fd());
    }
}

#[inline]
fn log_enabled_trace() -> bool {
    edgepoll_core::log::enabled(edgepoll_core::log::Level::Trace)
}
