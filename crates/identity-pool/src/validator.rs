//! Liveness probe for candidate identities

use std::time::Duration;

use tracing::debug;
use transport::HttpSession;

/// Default probe: a tiny JSON echo of the caller's address.
pub const DEFAULT_PROBE_URL: &str = "https://api.ipify.org?format=json";

/// Default bound on a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Confirms a session can reach the outside world.
#[derive(Debug, Clone)]
pub struct Validator {
    probe_url: String,
    timeout: Duration,
}

impl Validator {
    pub fn new(probe_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            probe_url: probe_url.into(),
            timeout,
        }
    }

    pub fn probe_url(&self) -> &str {
        &self.probe_url
    }

    /// True only for a 2xx answer within the timeout. Never errors.
    pub async fn validate(&self, session: &dyn HttpSession) -> bool {
        match tokio::time::timeout(self.timeout, session.get(&self.probe_url, self.timeout)).await {
            Ok(Ok(response)) if response.is_success() => true,
            Ok(Ok(response)) => {
                debug!(status = response.status, "probe returned non-success status");
                false
            }
            Ok(Err(e)) => {
                debug!(error = %e, "probe failed");
                false
            }
            Err(_) => {
                debug!(timeout_secs = self.timeout.as_secs(), "probe timed out");
                false
            }
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_URL, DEFAULT_PROBE_TIMEOUT)
    }
}
