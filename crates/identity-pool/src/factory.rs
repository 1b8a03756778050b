//! Identity factory: rotate the circuit, build a session, learn its exit.
//!
//! Rotation is global to the Tor daemon, so the whole sequence runs under a
//! single lock. Otherwise a second rotation could land between another
//! caller's rotation and its exit probe, and the probe would report the
//! wrong circuit.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tor_control::ControlChannel;
use tracing::{debug, info};
use transport::{HttpSession, SessionBuilder};

use crate::error::IdentityError;
use crate::identity::{Identity, PoolEntry, Tag};
use crate::validator::{DEFAULT_PROBE_TIMEOUT, DEFAULT_PROBE_URL};

/// Time to let a new circuit establish after `NEWNYM`.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FactorySettings {
    /// Must answer with JSON carrying an `ip` field
    pub probe_url: String,
    pub probe_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            probe_url: DEFAULT_PROBE_URL.to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

#[derive(Deserialize)]
struct IpEcho {
    ip: String,
}

/// Produces fresh identities from the anonymizing network.
pub struct IdentityFactory {
    control: Arc<dyn ControlChannel>,
    builder: Arc<dyn SessionBuilder>,
    settings: FactorySettings,
    rotation: Mutex<()>,
}

impl IdentityFactory {
    pub fn new(
        control: Arc<dyn ControlChannel>,
        builder: Arc<dyn SessionBuilder>,
        settings: FactorySettings,
    ) -> Self {
        Self {
            control,
            builder,
            settings,
            rotation: Mutex::new(()),
        }
    }

    /// Rotate to a new circuit and return an entry bound to its exit.
    ///
    /// Each step fails the whole attempt; the caller decides whether to retry.
    pub async fn new_identity(&self) -> Result<PoolEntry, IdentityError> {
        let _rotation = self.rotation.lock().await;

        self.control
            .request_new_circuit()
            .await
            .map_err(|e| IdentityError::ControlChannel(e.to_string()))?;
        if !self.settings.settle_delay.is_zero() {
            debug!(
                settle_secs = self.settings.settle_delay.as_secs(),
                "waiting for new circuit"
            );
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        let session = self.build_session()?;
        let identity = self.exit_address(session.as_ref()).await?;
        let tag = Tag::random();
        info!(identity = %identity, tag = %tag, "new identity");
        Ok(PoolEntry::new(identity, tag, session))
    }

    /// Build a session without rotating. Used to revive cached identities.
    pub fn build_session(&self) -> Result<Box<dyn HttpSession>, IdentityError> {
        self.builder
            .build()
            .map_err(|e| IdentityError::SessionBuild(e.to_string()))
    }

    /// Ask the probe endpoint which address the session exits from.
    pub async fn exit_address(
        &self,
        session: &dyn HttpSession,
    ) -> Result<Identity, IdentityError> {
        let timeout = self.settings.probe_timeout;
        let response = tokio::time::timeout(timeout, session.get(&self.settings.probe_url, timeout))
            .await
            .map_err(|_| {
                IdentityError::ExitProbe(format!("timed out after {}s", timeout.as_secs()))
            })?
            .map_err(|e| IdentityError::ExitProbe(e.to_string()))?;
        if !response.is_success() {
            return Err(IdentityError::ExitProbe(format!(
                "probe returned status {}",
                response.status
            )));
        }
        let echo: IpEcho = serde_json::from_str(&response.body)
            .map_err(|e| IdentityError::ExitProbe(format!("invalid probe body: {e}")))?;
        let ip = echo.ip.trim();
        if ip.is_empty() {
            return Err(IdentityError::ExitProbe("probe returned an empty address".into()));
        }
        Ok(Identity::new(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeNetwork, PROBE_URL, StaticSession};

    fn factory(net: &Arc<FakeNetwork>) -> IdentityFactory {
        IdentityFactory::new(net.clone(), net.clone(), FakeNetwork::factory_settings())
    }

    #[tokio::test]
    async fn new_identity_reports_rotated_exit() {
        let net = FakeNetwork::with_exits(&["10.0.0.1", "10.0.0.2"]);
        let factory = factory(&net);

        let first = factory.new_identity().await.unwrap();
        let second = factory.new_identity().await.unwrap();

        assert_eq!(first.identity().as_str(), "10.0.0.1");
        assert_eq!(second.identity().as_str(), "10.0.0.2");
        assert!(first.tag().value() >= Tag::MIN);
        assert_eq!(net.rotations(), 2);
    }

    #[tokio::test]
    async fn control_failure_aborts_attempt() {
        let net = FakeNetwork::with_exits(&["10.0.0.1"]);
        net.fail_next_rotations(1);
        let factory = factory(&net);

        let err = factory.new_identity().await.unwrap_err();
        assert!(matches!(err, IdentityError::ControlChannel(_)), "got: {err}");
        // No session may be built on a stale circuit
        assert_eq!(net.builds(), 0);

        let entry = factory.new_identity().await.unwrap();
        assert_eq!(entry.identity().as_str(), "10.0.0.1");
    }

    #[tokio::test]
    async fn exit_probe_failure_is_reported() {
        let net = FakeNetwork::with_exits(&["10.0.0.1"]);
        net.kill_build(1);
        let factory = factory(&net);

        let err = factory.new_identity().await.unwrap_err();
        assert!(matches!(err, IdentityError::ExitProbe(_)), "got: {err}");
    }

    #[tokio::test]
    async fn exit_address_rejects_malformed_body() {
        let net = FakeNetwork::with_exits(&[]);
        let factory = factory(&net);

        let session = StaticSession::body(200, "<html>not json</html>");
        let err = factory.exit_address(&session).await.unwrap_err();
        assert!(matches!(err, IdentityError::ExitProbe(_)), "got: {err}");

        let session = StaticSession::body(200, r#"{"ip": "  "}"#);
        assert!(factory.exit_address(&session).await.is_err());

        let session = StaticSession::body(200, r#"{"ip": "203.0.113.7"}"#);
        assert_eq!(
            factory.exit_address(&session).await.unwrap(),
            Identity::from("203.0.113.7")
        );
        assert_eq!(PROBE_URL, FakeNetwork::factory_settings().probe_url);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_is_applied_after_rotation() {
        let net = FakeNetwork::with_exits(&["10.0.0.1"]);
        let mut settings = FakeNetwork::factory_settings();
        settings.settle_delay = Duration::from_secs(5);
        let factory = IdentityFactory::new(net.clone(), net.clone(), settings);

        let start = tokio::time::Instant::now();
        factory.new_identity().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
