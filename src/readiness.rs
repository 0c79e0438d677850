//! Readiness multiplexing: report which of a set of handles currently
//! has data (or a pending connection) waiting.

#[cfg_attr(target_family = "unix", path = "readiness/readiness_posix.rs")]
#[cfg_attr(target_family = "windows", path = "readiness/readiness_win32.rs")]
mod impls;

use std::time::Duration;

use crate::error::Result;
use crate::sys::RawSock;

/// Wait up to `timeout` for any handle in `handles` to become readable
/// (data available, peer closed, or incoming connection pending) and
/// return the ready subset, preserving input order.
///
/// A zero timeout polls without blocking. An empty input returns empty
/// immediately, without touching the OS.
pub fn readable(handles: &[RawSock], timeout: Duration) -> Result<Vec<RawSock>> {
    if handles.is_empty() {
        return Ok(Vec::new());
    }

    Ok(impls::select_readable(handles, timeout)?)
}

/// Whether any handle in the set becomes readable within the timeout.
pub fn readable_any(handles: &[RawSock], timeout: Duration) -> Result<bool> {
    Ok(!readable(handles, timeout)?.is_empty())
}

pub(crate) fn wait_writable(sock: RawSock, timeout: Duration) -> std::io::Result<bool> {
    impls::select_writable(sock, timeout)
}
