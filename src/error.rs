use std::io;
use std::net::SocketAddr;

/// Errors raised by line and readiness operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed host literal, or an address-storage blob of an unknown
    /// family.
    #[error("invalid address `{addr}`: {reason}")]
    Address { addr: String, reason: &'static str },

    /// Name resolution failed; `detail` carries the system message.
    #[error("cannot resolve `{host}`: {detail}")]
    Resolve { host: String, detail: String },

    /// The requested operation contradicts the line's configuration or
    /// current state.
    #[error("{0}")]
    Config(&'static str),

    /// `connect` failed or timed out.
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, source: io::Error },

    /// Any other syscall failure (bind, listen, setsockopt, UDP
    /// send/recv, readiness poll).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Connection-terminating failure on the data path. The line has
    /// already closed itself; the caller's loop is expected to wind
    /// down without a diagnostic.
    #[error("connection aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, Error>;
