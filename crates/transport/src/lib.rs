//! HTTP transport abstraction for identity-bound sessions
//!
//! Defines the `HttpSession` and `SessionBuilder` traits that decouple the
//! identity pool from the concrete HTTP client. `SocksSessionBuilder` builds
//! reqwest clients routed through the Tor SOCKS port; tests substitute
//! in-process fakes implementing the same traits.

pub mod socks;

pub use socks::{ReqwestSession, SocksSessionBuilder};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// A completed HTTP response, reduced to what the pool needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Payload size in bytes.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }
}

/// Network-layer failures. Any HTTP status, including 5xx, is a response,
/// not a `TransportError`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to build session: {0}")]
    Build(String),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// A reusable client context bound to one exit identity.
///
/// Dropping the session closes its connections.
///
/// Uses `Pin<Box<dyn Future>>` return types so sessions can be held as
/// `Box<dyn HttpSession>`.
pub trait HttpSession: Send + Sync {
    /// Issue a GET with the given timeout.
    fn get<'a>(
        &'a self,
        url: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse>> + Send + 'a>>;
}

/// Constructs fresh sessions preconfigured for the anonymizing proxy.
pub trait SessionBuilder: Send + Sync {
    fn build(&self) -> Result<Box<dyn HttpSession>>;
}
