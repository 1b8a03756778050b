//! Tor control-port client
//!
//! Speaks the line-based Tor control protocol over TCP: authenticate, then
//! signal `NEWNYM` to rotate onto fresh circuits. The identity pool only sees
//! the `ControlChannel` trait, so tests can swap in a scripted network.
//!
//! Rotation flow:
//! 1. `TorController::connect()` opens a control connection
//! 2. `ControlConnection::authenticate()` with null, password or cookie auth
//! 3. `ControlConnection::signal(Signal::NewNym)` asks Tor for new circuits
//! 4. The connection is dropped; Tor keeps the new circuits

pub mod constants;
pub mod control;
pub mod error;
pub mod reachability;

pub use constants::*;
pub use control::{
    ControlAuth, ControlChannel, ControlConnection, Reply, Signal, TorController, parse_reply_line,
};
pub use error::{Error, Result};
pub use reachability::check_socks;
