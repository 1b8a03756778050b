//! reqwest sessions routed through a SOCKS5 proxy.
//!
//! Every session carries the same default headers so requests from different
//! exits cannot be told apart by header variance. `socks5h` resolves DNS on
//! the proxy side, keeping lookups inside the anonymizing network.
//!
//! Each session also presents its own random SOCKS username and password.
//! Tor's `IsolateSOCKSAuth` (on by default) never lets streams with
//! different credentials share a circuit, so a session keeps the exit it
//! was built on after later `NEWNYM` rotations.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use rand::RngExt;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::{HttpResponse, HttpSession, Result, SessionBuilder, TransportError};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
const DEFAULT_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

/// Per-session SOCKS credentials. Only their uniqueness matters to Tor.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IsolationCredentials {
    username: String,
    password: String,
}

impl IsolationCredentials {
    fn random() -> Self {
        let mut rng = rand::rng();
        Self {
            username: format!("{:016x}", rng.random::<u64>()),
            password: format!("{:016x}", rng.random::<u64>()),
        }
    }
}

/// Builds `ReqwestSession`s bound to a SOCKS5 endpoint, each on its own
/// isolated circuit.
#[derive(Debug, Clone)]
pub struct SocksSessionBuilder {
    socks_addr: SocketAddr,
    headers: HeaderMap,
}

impl SocksSessionBuilder {
    pub fn new(socks_addr: SocketAddr) -> Self {
        Self {
            socks_addr,
            headers: default_headers(),
        }
    }

    /// Proxy endpoint, without credentials.
    pub fn proxy_url(&self) -> String {
        format!("socks5h://{}", self.socks_addr)
    }

    fn isolated_proxy_url(&self, credentials: &IsolationCredentials) -> String {
        format!(
            "socks5h://{}:{}@{}",
            credentials.username, credentials.password, self.socks_addr
        )
    }
}

impl SessionBuilder for SocksSessionBuilder {
    fn build(&self) -> Result<Box<dyn HttpSession>> {
        let credentials = IsolationCredentials::random();
        let proxy = reqwest::Proxy::all(self.isolated_proxy_url(&credentials))
            .map_err(|e| {
                TransportError::Build(format!("invalid proxy {}: {e}", self.proxy_url()))
            })?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .default_headers(self.headers.clone())
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))?;
        debug!(proxy = %self.proxy_url(), isolation = %credentials.username, "built session");
        Ok(Box::new(ReqwestSession { client }))
    }
}

/// Session backed by a reqwest client with its own connection pool.
pub struct ReqwestSession {
    client: reqwest::Client,
}

impl HttpSession for ReqwestSession {
    fn get<'a>(
        &'a self,
        url: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| classify(e, timeout))?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(|e| classify(e, timeout))?;
            Ok(HttpResponse { status, body })
        })
    }
}

fn classify(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Request(error.to_string())
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE),
    );
    headers
}
