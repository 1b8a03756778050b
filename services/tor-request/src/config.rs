//! Configuration types and loading
//!
//! Config precedence: `--config` > `CONFIG_PATH` env > `tor-request.toml`.
//! Every section and field is optional. The control password is loaded from
//! the TOR_CONTROL_PASSWORD env var or control_password_file, never stored
//! in the TOML directly.

use common::Secret;
use identity_pool::{DispatchSettings, FactorySettings, PoolSettings, Validator};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tor_control::ControlAuth;

/// Config file used when neither `--config` nor `CONFIG_PATH` is given
pub const DEFAULT_CONFIG_FILE: &str = "tor-request.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tor: TorConfig,
    pub pool: PoolConfig,
    pub dispatch: DispatchConfig,
    pub metrics: MetricsConfig,
}

/// Local Tor daemon endpoints
#[derive(Debug, Deserialize)]
pub struct TorConfig {
    #[serde(default = "default_socks_addr")]
    pub socks_addr: SocketAddr,
    #[serde(default = "default_control_addr")]
    pub control_addr: SocketAddr,
    #[serde(skip)]
    pub control_password: Option<Secret<String>>,
    /// File holding the control-port password (alternative to TOR_CONTROL_PASSWORD)
    #[serde(default)]
    pub control_password_file: Option<PathBuf>,
    /// Tor's control_auth_cookie, used when no password is configured
    #[serde(default)]
    pub cookie_file: Option<PathBuf>,
    #[serde(default = "default_control_timeout")]
    pub control_timeout_secs: u64,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
}

/// Identity pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_max_fresh_attempts")]
    pub max_fresh_attempts: u32,
    #[serde(default = "default_fresh_backoff")]
    pub fresh_backoff_secs: u64,
}

/// Request dispatch settings
#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

/// Prometheus exposition
#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    /// Scrape endpoint, served only while a run is in progress
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

fn default_socks_addr() -> SocketAddr {
    tor_control::DEFAULT_SOCKS_ADDR
}

fn default_control_addr() -> SocketAddr {
    tor_control::DEFAULT_CONTROL_ADDR
}

fn default_control_timeout() -> u64 {
    tor_control::DEFAULT_CONTROL_TIMEOUT.as_secs()
}

fn default_settle_delay() -> u64 {
    identity_pool::factory::DEFAULT_SETTLE_DELAY.as_secs()
}

fn default_cache_file() -> PathBuf {
    PathBuf::from("tor_ip_cache.json")
}

fn default_probe_url() -> String {
    identity_pool::validator::DEFAULT_PROBE_URL.to_string()
}

fn default_probe_timeout() -> u64 {
    identity_pool::validator::DEFAULT_PROBE_TIMEOUT.as_secs()
}

fn default_max_fresh_attempts() -> u32 {
    identity_pool::pool::DEFAULT_MAX_FRESH_ATTEMPTS
}

fn default_fresh_backoff() -> u64 {
    identity_pool::pool::DEFAULT_FRESH_BACKOFF.as_secs()
}

fn default_request_timeout() -> u64 {
    identity_pool::dispatch::DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_max_attempts() -> u32 {
    identity_pool::dispatch::DEFAULT_MAX_ATTEMPTS
}

fn default_max_workers() -> usize {
    identity_pool::dispatch::DEFAULT_MAX_WORKERS
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            socks_addr: default_socks_addr(),
            control_addr: default_control_addr(),
            control_password: None,
            control_password_file: None,
            cookie_file: None,
            control_timeout_secs: default_control_timeout(),
            settle_delay_secs: default_settle_delay(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cache_file: default_cache_file(),
            probe_url: default_probe_url(),
            probe_timeout_secs: default_probe_timeout(),
            max_fresh_attempts: default_max_fresh_attempts(),
            fresh_backoff_secs: default_fresh_backoff(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            max_attempts: default_max_attempts(),
            max_workers: default_max_workers(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// The default config file may be absent, in which case every setting
    /// takes its default. An explicitly named file must exist.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = if path == Path::new(DEFAULT_CONFIG_FILE) && !path.exists() {
            String::new()
        } else {
            std::fs::read_to_string(path)?
        };
        Self::parse(&contents)
    }

    /// Parse and validate TOML text, then resolve the control password.
    ///
    /// Password resolution order:
    /// 1. TOR_CONTROL_PASSWORD env var
    /// 2. control_password_file path from config
    pub fn parse(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;

        if let Some(password) = std::env::var("TOR_CONTROL_PASSWORD")
            .ok()
            .filter(|p| !p.is_empty())
        {
            config.tor.control_password = Some(Secret::new(password));
        } else if let Some(ref password_file) = config.tor.control_password_file {
            config.tor.control_password = Secret::from_file(password_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read control_password_file {}: {e}",
                    password_file.display()
                ))
            })?;
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.pool.probe_url.starts_with("http://")
            && !self.pool.probe_url.starts_with("https://")
        {
            return Err(common::Error::invalid_field(
                "pool.probe_url",
                format!("must start with http:// or https://, got: {}", self.pool.probe_url),
            ));
        }
        if self.pool.cache_file.as_os_str().is_empty() {
            return Err(common::Error::invalid_field("pool.cache_file", "must not be empty"));
        }

        let non_zero = [
            ("tor.control_timeout_secs", self.tor.control_timeout_secs),
            ("pool.probe_timeout_secs", self.pool.probe_timeout_secs),
            ("pool.max_fresh_attempts", u64::from(self.pool.max_fresh_attempts)),
            ("dispatch.request_timeout_secs", self.dispatch.request_timeout_secs),
            ("dispatch.max_attempts", u64::from(self.dispatch.max_attempts)),
            ("dispatch.max_workers", self.dispatch.max_workers as u64),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(common::Error::invalid_field(field, "must be greater than 0"));
            }
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    /// Control-port authentication: password, then cookie, then none.
    pub fn control_auth(&self) -> ControlAuth {
        if let Some(password) = &self.tor.control_password {
            ControlAuth::Password(password.clone())
        } else if let Some(cookie) = &self.tor.cookie_file {
            ControlAuth::Cookie(cookie.clone())
        } else {
            ControlAuth::Null
        }
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.tor.control_timeout_secs)
    }

    pub fn factory_settings(&self) -> FactorySettings {
        FactorySettings {
            probe_url: self.pool.probe_url.clone(),
            probe_timeout: Duration::from_secs(self.pool.probe_timeout_secs),
            settle_delay: Duration::from_secs(self.tor.settle_delay_secs),
        }
    }

    pub fn validator(&self) -> Validator {
        Validator::new(
            self.pool.probe_url.clone(),
            Duration::from_secs(self.pool.probe_timeout_secs),
        )
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_fresh_attempts: self.pool.max_fresh_attempts,
            fresh_backoff: Duration::from_secs(self.pool.fresh_backoff_secs),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            request_timeout: Duration::from_secs(self.dispatch.request_timeout_secs),
            max_attempts: self.dispatch.max_attempts,
            max_workers: self.dispatch.max_workers,
        }
    }
}
