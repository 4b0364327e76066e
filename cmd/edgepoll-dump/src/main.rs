//! edgepoll-dump
//!
//! TCP sink on the edgepoll worker pool. Every chunk a client sends is
//! logged (length plus a printable preview) and then discarded.
//!
//! Usage:
//!     cargo build --release -p edgepoll-dump
//!     EDGEPOLL_LOG_LEVEL=info ./target/release/edgepoll-dump [addr] [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9998
//!
//! Configuration comes from the environment (`EDGEPOLL_WORKERS`,
//! `EDGEPOLL_EVENTS`, `EDGEPOLL_BACKLOG`, `EDGEPOLL_WAIT_TIMEOUT_MS`).
//! Ctrl-C prints per-worker stats and exits.

use edgepoll::{Connection, ServerConfig, TcpServer};
use edgepoll_core::log::{self, Level};
use edgepoll_core::{log_error, log_info};
use edgepoll_sys::LibcSyscalls;

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PREVIEW: usize = 64;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn preview(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(PREVIEW)
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}

fn dump(conn: &mut Connection) -> bool {
    let mut buf = Vec::with_capacity(conn.buffered());
    if conn.read_to_end(&mut buf).is_err() || buf.is_empty() {
        return false;
    }
    log_info!("{} fd={} {} bytes: {}", conn.peer_addr(), conn.fd(), buf.len(), preview(&buf));
    true
}

fn main() {
    log::init();
    if log::level() < Level::Info {
        log::set_level(Level::Info);
    }

    let args: Vec<String> = std::env::args().collect();
    let addr = args.get(1).cloned().unwrap_or_default();
    let port: u16 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(9998);

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_sigint as libc::sighandler_t);
    }

    let config = ServerConfig::from_env();
    let server = match TcpServer::bind(&addr, port, config, LibcSyscalls::shared()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            log_error!("edgepoll-dump: {}", e);
            std::process::exit(1);
        }
    };
    server.on_client_read(dump);

    let watcher = {
        let server = server.clone();
        thread::Builder::new()
            .name("edgepoll-signal".into())
            .spawn(move || {
                while RUNNING.load(Ordering::SeqCst) && !server.is_closed() {
                    thread::sleep(Duration::from_millis(50));
                }
                server.close();
            })
    };
    if let Err(e) = &watcher {
        log_error!("edgepoll-dump: no signal watcher: {}", e);
    }

    let result = server.start();
    server.close();
    if let Ok(w) = watcher {
        let _ = w.join();
    }

    for r in server.join_workers() {
        if let Err(e) = r {
            log_error!("worker: {}", e);
        }
    }
    for s in server.stats() {
        log_info!(
            "worker {}: adopted={} forgotten={} closed={} bytes={} callbacks={} declined={}",
            s.id,
            s.adopted,
            s.forgotten,
            s.closed,
            s.bytes_read,
            s.callbacks,
            s.declined
        );
    }

    if let Err(e) = result {
        log_error!("edgepoll-dump: {}", e);
        std::process::exit(1);
    }
}
