//! Error types for Artisan.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The command did not reach a terminal state before the deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The command finished with a non-zero exit status.
    #[error("command exited with status {status}")]
    NonZeroExit { status: i32 },

    #[error("already closed: {0}")]
    AlreadyClosed(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// No response arrived on the wire within the round-trip timeout.
    #[error("no response from agent within {0:?}")]
    ResponseTimeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Exit status carried by a `NonZeroExit` failure.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Error::NonZeroExit { status } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
