//! Pre-flight check that a SOCKS listener is accepting connections.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};

/// Open and immediately close a TCP connection to the SOCKS endpoint.
///
/// Says nothing about circuit health, only that a proxy is listening.
pub async fn check_socks(addr: SocketAddr, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => {
            debug!(%addr, "SOCKS endpoint reachable");
            Ok(())
        }
        Ok(Err(e)) => Err(Error::Connect(format!("{addr}: {e}"))),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}
