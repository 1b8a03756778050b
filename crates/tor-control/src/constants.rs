//! Tor endpoint defaults
//!
//! Ports match a stock `tor` daemon with `ControlPort 9051` enabled.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Default SOCKS5 listener of a local Tor daemon
pub const DEFAULT_SOCKS_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9050));

/// Default control port of a local Tor daemon
pub const DEFAULT_CONTROL_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9051));

/// Timeout for the SOCKS reachability check before a run starts
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on one control-port exchange
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Control reply code for success
pub const REPLY_OK: u16 = 250;
