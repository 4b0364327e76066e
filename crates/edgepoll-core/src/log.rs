//! Leveled stderr logging for the accept and worker loops
//!
//! Every line is written under the stderr lock and tagged with the name of
//! the emitting thread, so interleaved output from the acceptor and the
//! worker pollers stays readable:
//!
//! ```text
//! [INFO ] edgepoll-worker-1: adopted fd=12 peer=127.0.0.1:51544
//! ```
//!
//! # Environment Variables
//!
//! - `EDGEPOLL_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//! - `EDGEPOLL_LOG_FLUSH=1` - flush stderr after each line
//!
//! # Usage
//!
//! ```ignore
//! use edgepoll_core::{log_info, log_debug};
//!
//! log_info!("listening on {}", addr);
//! log_debug!("fd={} read {} bytes", fd, n);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Level::Off,
            1 => Level::Error,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            _ => Level::Trace,
        }
    }

    /// Parse a level name or digit. Unknown input yields `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Some(Level::Off),
            "error" | "1" => Some(Level::Error),
            "warn" | "2" => Some(Level::Warn),
            "info" | "3" => Some(Level::Info),
            "debug" | "4" => Some(Level::Debug),
            "trace" | "5" => Some(Level::Trace),
            _ => None,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            Level::Off => "",
            Level::Error => "[ERROR]",
            Level::Warn => "[WARN ]",
            Level::Info => "[INFO ]",
            Level::Debug => "[DEBUG]",
            Level::Trace => "[TRACE]",
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(Level::Warn as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Load level and flush mode from the environment. Idempotent.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Some(level) = std::env::var("EDGEPOLL_LOG_LEVEL").ok().and_then(|v| Level::parse(&v)) {
        LEVEL.store(level as u8, Ordering::Relaxed);
    }
    if let Ok(v) = std::env::var("EDGEPOLL_LOG_FLUSH") {
        FLUSH.store(matches!(v.as_str(), "1" | "true" | "yes" | "on"), Ordering::Relaxed);
    }
}

#[inline]
pub fn level() -> Level {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    Level::from_u8(LEVEL.load(Ordering::Relaxed))
}

/// Override the level (wins over the environment once `init` has run).
pub fn set_level(level: Level) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush(enabled: bool) {
    FLUSH.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn enabled(level: Level) -> bool {
    level != Level::Off && level <= self::level()
}

#[doc(hidden)]
pub fn _log_impl(level: Level, args: std::fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("?");

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} {}: ", level.tag(), name);
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Error, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Warn, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Info, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Debug, format_args!($($arg)*));
    }};
}

/// Per-event chatter. Guarded by `enabled` at the call site in hot loops.
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("DEBUG"), Some(Level::Debug));
        assert_eq!(Level::parse(" 2 "), Some(Level::Warn));
        assert_eq!(Level::parse("loud"), None);
        assert_eq!(Level::from_u8(99), Level::Trace);
    }

    #[test]
    fn test_macros_compile() {
        set_level(Level::Off);
        assert!(!enabled(Level::Error));
        log_error!("error {}", 1);
        log_warn!("warn");
        log_info!("info {}", "x");
        log_debug!("debug");
        log_trace!("trace");
    }
}
