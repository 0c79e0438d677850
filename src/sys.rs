//! Thin socket-ops façade over the platform socket API, implemented
//! once for POSIX and once for Winsock2 with a shared signature set.

#[cfg_attr(target_family = "unix", path = "sys/sys_posix.rs")]
#[cfg_attr(target_family = "windows", path = "sys/sys_win32.rs")]
mod impls;

pub use impls::*;

#[cfg(target_family = "unix")]
pub type RawSock = std::os::raw::c_int;
#[cfg(target_family = "windows")]
pub type RawSock = usize;

/// The "no socket" sentinel (`-1` / `INVALID_SOCKET`).
#[cfg(target_family = "unix")]
pub const INVALID_SOCK: RawSock = -1;
#[cfg(target_family = "windows")]
pub const INVALID_SOCK: RawSock = usize::MAX;
