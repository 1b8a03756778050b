//! Shared types for the tor-request workspace
//!
//! Configuration errors used by the binary's config loader, and the `Secret`
//! wrapper that keeps the Tor control password out of logs.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
