//! Prometheus metrics exposition
//!
//! - `tor_request_requests_total` (counter): label `outcome` (`done`, `failed`)
//! - `tor_request_attempts_total` (counter): label `result` (`success` or a failure kind)
//! - `tor_request_identities_acquired_total` (counter)
//! - `tor_request_identities_evicted_total` (counter): label `reason`
//! - `tor_request_identity_rejections_total` (counter): label `reason`
//! - `tor_request_pool_queue_depth` (gauge)
//!
//! Without an installed recorder every call here is a no-op.

use std::net::SocketAddr;

use anyhow::Context;
use identity_pool::{FailureKind, PoolEvent};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with a scrape endpoint on `listen_addr`.
///
/// Must be called from within the tokio runtime; the listener runs as a
/// background task for the rest of the process.
pub fn install_exporter(listen_addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen_addr)
        .install()
        .with_context(|| format!("failed to start metrics listener on {listen_addr}"))
}

/// Record the counters implied by a pool or dispatch event.
pub fn record_event(event: &PoolEvent) {
    match event {
        PoolEvent::IdentityAcquired { .. } => {
            metrics::counter!("tor_request_identities_acquired_total").increment(1);
        }
        PoolEvent::IdentityEvicted { reason, .. } => {
            metrics::counter!("tor_request_identities_evicted_total", "reason" => reason.label())
                .increment(1);
        }
        PoolEvent::IdentityRejected { reason, .. } => {
            metrics::counter!("tor_request_identity_rejections_total", "reason" => reason.label())
                .increment(1);
        }
        PoolEvent::RequestSucceeded { .. } => {
            metrics::counter!("tor_request_requests_total", "outcome" => "done").increment(1);
            metrics::counter!("tor_request_attempts_total", "result" => "success").increment(1);
        }
        PoolEvent::RequestRetrying { reason, .. } => {
            metrics::counter!("tor_request_attempts_total", "result" => reason.label())
                .increment(1);
        }
        PoolEvent::RequestFailed {
            reason, attempts, ..
        } => {
            metrics::counter!("tor_request_requests_total", "outcome" => "failed").increment(1);
            // A pool_exhausted failure never reached a final send
            if *attempts > 0 && *reason != FailureKind::PoolExhausted {
                metrics::counter!("tor_request_attempts_total", "result" => reason.label())
                    .increment(1);
            }
        }
        _ => {}
    }
}

/// Number of ready entries in the work queue.
pub fn set_queue_depth(depth: usize) {
    metrics::gauge!("tor_request_pool_queue_depth").set(depth as f64);
}
