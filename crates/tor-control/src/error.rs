//! Error types for control-port operations

use std::time::Duration;

/// Errors from the Tor control channel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("control port connection failed: {0}")]
    Connect(String),

    #[error("control port authentication failed: {0}")]
    Authentication(String),

    #[error("control command {command} rejected ({code}): {message}")]
    Rejected {
        command: String,
        code: u16,
        message: String,
    },

    #[error("malformed control reply: {0}")]
    Protocol(String),

    #[error("control port timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for control operations.
pub type Result<T> = std::result::Result<T, Error>;
