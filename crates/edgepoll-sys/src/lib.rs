//! # edgepoll-sys - `Syscalls` implementations
//!
//! | Impl             | Use                                           |
//! |------------------|-----------------------------------------------|
//! | `LibcSyscalls`   | default; direct libc calls                    |
//! | `FaultySyscalls` | tests; wraps another impl, fails chosen calls |
//!
//! Both speak raw epoll and Linux socket options, so the crate only builds
//! for Linux.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod libc_syscalls;
        pub mod faulty;

        pub use libc_syscalls::LibcSyscalls;
        pub use faulty::FaultySyscalls;
    } else {
        compile_error!("edgepoll-sys requires Linux (epoll, TCP_QUICKACK)");
    }
}
