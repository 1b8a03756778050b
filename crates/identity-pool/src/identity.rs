//! Identities, tags and the entries that bind them to sessions

use std::fmt;

use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::debug;
use transport::HttpSession;

/// An exit address the anonymizing network currently routes through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Opaque numeric label stored next to each identity in the cache.
///
/// Persisted as the `port` field for compatibility with existing cache files.
/// Nothing reads it back for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(u16);

impl Tag {
    pub const MIN: u16 = 1024;

    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Uniform in `1024..=65535`.
    pub fn random() -> Self {
        Self(rand::rng().random_range(Self::MIN..=u16::MAX))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An identity bound to the session that reaches it.
///
/// Owned by exactly one holder at a time: the work queue, the cached
/// reserve, or the worker that checked it out.
pub struct PoolEntry {
    identity: Identity,
    tag: Tag,
    session: Box<dyn HttpSession>,
}

impl PoolEntry {
    pub fn new(identity: Identity, tag: Tag, session: Box<dyn HttpSession>) -> Self {
        Self {
            identity,
            tag,
            session,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn session(&self) -> &dyn HttpSession {
        self.session.as_ref()
    }

    /// Close the session and return the identity it was bound to.
    pub fn close(self) -> Identity {
        debug!(identity = %self.identity, "closing session");
        self.identity
    }
}

impl fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("identity", &self.identity)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}
