//! Classification of send results
//!
//! 429 means the exit is rate limited and 5xx means the target is refusing
//! this exit; both retire the identity. Every other status is a completed
//! request, including 4xx: those are the target's answer, not the exit's fault.

use serde::Serialize;
use transport::HttpResponse;

/// Why an attempt or a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network-layer failure before a response arrived
    Transport,
    /// 429 from the target
    RateLimited,
    /// 5xx from the target
    ServerError,
    /// No usable identity could be acquired
    PoolExhausted,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Transport => "transport",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::ServerError => "server_error",
            FailureKind::PoolExhausted => "pool_exhausted",
        }
    }
}

/// Result of one send, tagged for the dispatch state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Success { status: u16, bytes: usize },
    Retry { kind: FailureKind, status: Option<u16> },
}

/// Classify a response status. `None` means the request completed.
pub fn classify_status(status: u16) -> Option<FailureKind> {
    match status {
        429 => Some(FailureKind::RateLimited),
        s if s >= 500 => Some(FailureKind::ServerError),
        _ => None,
    }
}

/// Classify the outcome of a send.
pub fn classify_send(result: &transport::Result<HttpResponse>) -> AttemptResult {
    match result {
        Ok(response) => match classify_status(response.status) {
            None => AttemptResult::Success {
                status: response.status,
                bytes: response.body_len(),
            },
            Some(kind) => AttemptResult::Retry {
                kind,
                status: Some(response.status),
            },
        },
        Err(_) => AttemptResult::Retry {
            kind: FailureKind::Transport,
            status: None,
        },
    }
}
