//! Service-specific error types

use std::net::SocketAddr;

use thiserror::Error;

/// Startup errors. Per-request failures are outcomes reported by the
/// dispatcher and never propagate as Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Tor is not running: SOCKS endpoint {addr} unreachable ({reason})")]
    TorNotRunning { addr: SocketAddr, reason: String },

    #[error("invalid target {0:?}: expected a domain like example.com or an http(s) URL")]
    InvalidTarget(String),

    #[error("invalid request count {0:?}: expected a positive integer")]
    InvalidCount(String),

    #[error("{0}")]
    Usage(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
