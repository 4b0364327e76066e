//! # edgepoll
//!
//! Edge-triggered epoll TCP server core.
//!
//! One acceptor loop owns the listening socket and hands each accepted
//! client, round-robin, to one of N worker pollers. A worker owns its
//! connections outright, drains their sockets into pooled `ChunkBuffer`s
//! and invokes the read callback with the connection.
//!
//! ```text
//!                    ┌───────────────┐
//!   listen fd ──────►│  acceptor     │  TcpServer::start (caller's thread)
//!                    └──────┬────────┘
//!                           │ Adopt(conn) + epoll_ctl(ADD)
//!             ┌─────────────┼─────────────┐
//!             ▼             ▼             ▼
//!       edgepoll-worker-0  ...   edgepoll-worker-N-1
//!        epoll + conns          epoll + conns
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::io::Read;
//!
//! let server = edgepoll::new_server("", 8080)?;
//! server.on_client_read(|conn| {
//!     let mut buf = Vec::new();
//!     conn.read_to_end(&mut buf).ok();
//!     println!("{} sent {} bytes", conn.peer_addr(), buf.len());
//!     true
//! });
//! server.start()?;
//! ```
//!
//! Every kernel call goes through `edgepoll_core::Syscalls`; pass a
//! `FaultySyscalls` to `TcpServer::bind` to exercise failure paths.

pub mod config;
pub mod conn;
pub mod poller;
pub mod worker;
pub mod server;

pub use config::{default_wait_timeout, set_default_wait_timeout, ServerConfig, MAX_WORKERS};
pub use conn::Connection;
pub use poller::{Event, Poller, PollerHandle};
pub use server::{new_server, TcpServer};
pub use worker::{ReadCallback, WorkerStats};

pub use edgepoll_core::{ChunkBuffer, ChunkPool, NetError, Result, SysOp, Syscalls};
