//! Server configuration

use edgepoll_core::constants::{
    DEFAULT_EVENTS_CAPACITY, DEFAULT_LISTEN_BACKLOG, DEFAULT_WAIT_TIMEOUT_MS,
};
use edgepoll_core::error::{NetError, Result};

use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};

/// Upper bound on worker pollers.
pub const MAX_WORKERS: usize = 64;

static DEFAULT_WAIT_TIMEOUT: AtomicI32 = AtomicI32::new(DEFAULT_WAIT_TIMEOUT_MS);

/// Set the epoll_wait timeout picked up by pollers created from now on.
///
/// Existing pollers keep the value they were created with. A negative
/// value blocks indefinitely, which also means loops stop noticing
/// `close()` until the next event.
pub fn set_default_wait_timeout(ms: i32) {
    DEFAULT_WAIT_TIMEOUT.store(ms, Ordering::Relaxed);
}

pub fn default_wait_timeout() -> i32 {
    DEFAULT_WAIT_TIMEOUT.load(Ordering::Relaxed)
}

/// Configuration for a `TcpServer`
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of worker pollers, one OS thread each (defaults to CPU count)
    pub workers: usize,

    /// epoll event buffer entries per poller
    pub events_capacity: usize,

    /// listen(2) backlog
    pub listen_backlog: i32,

    /// epoll_wait timeout; `None` uses the process-wide default
    pub wait_timeout_ms: Option<i32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            workers: num_cpus.min(MAX_WORKERS),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            wait_timeout_ms: None,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `EDGEPOLL_WORKERS`, `EDGEPOLL_EVENTS`,
    /// `EDGEPOLL_BACKLOG` and `EDGEPOLL_WAIT_TIMEOUT_MS`. Unparseable
    /// values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse("EDGEPOLL_WORKERS") {
            config.workers = n;
        }
        if let Some(n) = env_parse("EDGEPOLL_EVENTS") {
            config.events_capacity = n;
        }
        if let Some(n) = env_parse("EDGEPOLL_BACKLOG") {
            config.listen_backlog = n;
        }
        if let Some(ms) = env_parse("EDGEPOLL_WAIT_TIMEOUT_MS") {
            config.wait_timeout_ms = Some(ms);
        }
        config
    }

    /// Set number of worker pollers
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    /// Set epoll event buffer capacity per poller
    pub fn events_capacity(mut self, n: usize) -> Self {
        self.events_capacity = n;
        self
    }

    /// Set listen backlog
    pub fn listen_backlog(mut self, n: i32) -> Self {
        self.listen_backlog = n;
        self
    }

    /// Set epoll_wait timeout for this server's pollers
    pub fn wait_timeout_ms(mut self, ms: i32) -> Self {
        self.wait_timeout_ms = Some(ms);
        self
    }

    /// The timeout pollers will be created with.
    pub fn effective_wait_timeout(&self) -> i32 {
        self.wait_timeout_ms.unwrap_or_else(default_wait_timeout)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(NetError::InvalidPoolSize(self.workers));
        }
        Ok(())
    }
}
