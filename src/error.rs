//! Structured error types for the supervisor
//!
//! The library reports typed errors; the binary wraps them with `anyhow`
//! context. One failed operation must never take the supervisor down, so
//! almost every error here is logged at the event-loop boundary and
//! dropped rather than propagated out of `Supervisor::run`.

use std::io;
use thiserror::Error;

/// Errors produced by supervisor operations
#[derive(Debug, Error)]
pub enum Error {
    /// Generic I/O failure (file opens, FIFO reads, status writes)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Raw syscall failure reported by errno
    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// A control message that could not be decoded
    #[error("malformed control message: {0}")]
    Protocol(String),

    /// The status block on disk did not have the expected shape
    #[error("malformed status block: {0}")]
    Status(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a protocol error from anything printable
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
