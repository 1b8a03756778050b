//! Reporter interface for pool state changes and request outcomes
//!
//! The core never prints. It hands every event to a `Reporter`; the binary
//! decides how to present them. `TracingReporter` is the default sink.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::FailureKind;
use crate::identity::{Identity, Tag};

/// Why an identity-acquisition attempt produced no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Circuit rotation or control-port authentication failed
    ControlChannel,
    /// The fresh session could not be built
    SessionBuild,
    /// The exit address could not be learned
    ExitProbe,
    /// The exit address is already claimed
    Duplicate,
    /// The liveness probe failed
    Validation,
}

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::ControlChannel => "control_channel",
            RejectReason::SessionBuild => "session_build",
            RejectReason::ExitProbe => "exit_probe",
            RejectReason::Duplicate => "duplicate",
            RejectReason::Validation => "validation",
        }
    }
}

/// Structured pool and dispatch events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    CacheLoaded {
        cached: usize,
        used: usize,
    },
    CacheUnavailable {
        error: String,
    },
    CacheWriteFailed {
        error: String,
    },
    CachedIdentityRestored {
        identity: Identity,
        tag: Tag,
    },
    CachedIdentityPruned {
        identity: Identity,
    },
    IdentityAcquired {
        identity: Identity,
        tag: Tag,
        attempt: u32,
    },
    IdentityRejected {
        identity: Option<Identity>,
        attempt: u32,
        reason: RejectReason,
    },
    IdentityEvicted {
        identity: Identity,
        reason: FailureKind,
    },
    EntryQueued {
        identity: Identity,
        tag: Tag,
        queued: usize,
        requested: usize,
    },
    PrepareShortfall {
        prepared: usize,
        requested: usize,
    },
    RequestStarted {
        request: usize,
        worker: usize,
        identity: Identity,
        attempt: u32,
    },
    RequestSucceeded {
        request: usize,
        worker: usize,
        status: u16,
        bytes: usize,
        attempts: u32,
    },
    RequestRetrying {
        request: usize,
        worker: usize,
        attempt: u32,
        reason: FailureKind,
        status: Option<u16>,
    },
    RequestFailed {
        request: usize,
        worker: usize,
        reason: FailureKind,
        attempts: u32,
    },
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolEvent::CacheLoaded { cached, used } => {
                write!(f, "Loaded {cached} cached sessions ({used} known identities)")
            }
            PoolEvent::CacheUnavailable { error } => {
                write!(f, "Cache unavailable, starting empty: {error}")
            }
            PoolEvent::CacheWriteFailed { error } => write!(f, "Error saving cache: {error}"),
            PoolEvent::CachedIdentityRestored { identity, tag } => {
                write!(f, "Initialized cached session - IP: {identity}, Tag: {tag}")
            }
            PoolEvent::CachedIdentityPruned { identity } => {
                write!(f, "Removed invalid cached session - IP: {identity}")
            }
            PoolEvent::IdentityAcquired {
                identity,
                tag,
                attempt,
            } => write!(
                f,
                "Acquired identity {identity} (tag {tag}) on attempt {attempt}"
            ),
            PoolEvent::IdentityRejected {
                identity: Some(identity),
                attempt,
                reason,
            } => write!(
                f,
                "IP {identity} rejected ({}) on attempt {attempt}, getting new identity...",
                reason.label()
            ),
            PoolEvent::IdentityRejected {
                identity: None,
                attempt,
                reason,
            } => write!(
                f,
                "Identity attempt {attempt} failed ({}), retrying...",
                reason.label()
            ),
            PoolEvent::IdentityEvicted { identity, reason } => {
                write!(f, "Evicted identity {identity} ({})", reason.label())
            }
            PoolEvent::EntryQueued {
                identity,
                tag,
                queued,
                requested,
            } => write!(
                f,
                "Prepared session {queued}/{requested} - IP: {identity}, Tag: {tag}"
            ),
            PoolEvent::PrepareShortfall {
                prepared,
                requested,
            } => write!(
                f,
                "Only prepared {prepared} of {requested} sessions; more will be acquired on demand"
            ),
            PoolEvent::RequestStarted {
                request,
                worker,
                identity,
                attempt,
            } => write!(
                f,
                "Request {request} (worker {worker}) - attempt {attempt} using IP {identity}"
            ),
            PoolEvent::RequestSucceeded {
                request,
                worker,
                status,
                bytes,
                ..
            } => write!(
                f,
                "Request {request} (worker {worker}) - Status Code: {status}, Response Length: {bytes} bytes"
            ),
            PoolEvent::RequestRetrying {
                request,
                worker,
                attempt,
                reason,
                status,
            } => {
                write!(
                    f,
                    "Request {request} (worker {worker}) - attempt {attempt} failed ({}",
                    reason.label()
                )?;
                if let Some(status) = status {
                    write!(f, " {status}")?;
                }
                write!(f, "), getting new identity...")
            }
            PoolEvent::RequestFailed {
                request,
                worker,
                reason,
                attempts,
            } => write!(
                f,
                "Request {request} (worker {worker}) - failed after {attempts} attempts ({})",
                reason.label()
            ),
        }
    }
}

/// Receives pool events. Implementations must not block.
pub trait Reporter: Send + Sync {
    fn report(&self, event: &PoolEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, event: &PoolEvent) {
        match event {
            PoolEvent::CacheUnavailable { .. }
            | PoolEvent::CacheWriteFailed { .. }
            | PoolEvent::PrepareShortfall { .. }
            | PoolEvent::RequestFailed { .. } => warn!(?event, "{event}"),
            PoolEvent::IdentityRejected { .. } | PoolEvent::RequestStarted { .. } => {
                debug!(?event, "{event}")
            }
            _ => info!(?event, "{event}"),
        }
    }
}
