//! Identity pool for anonymized HTTP requests
//!
//! Keeps a set of distinct Tor exit identities, each bound to its own HTTP
//! session, and hands them to dispatch workers so that no two concurrent
//! requests ever leave through the same exit. Identities that fail, get
//! rate limited or hit server errors are evicted and replaced.
//!
//! Identity lifecycle:
//! 1. Startup: cached identities are rebuilt and revalidated, stale ones pruned
//! 2. `prepare(n)` queues cached entries first, then fresh ones from the factory
//! 3. A worker checks out an entry with `acquire_next()` and sends its request
//! 4. Success → `release()` puts the entry back at the tail of the queue
//! 5. Transport failure, 429 or 5xx → `evict()` and retry on a fresh identity
//! 6. Every bookkeeping change rewrites the on-disk cache

pub mod cache;
pub mod classify;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod identity;
pub mod pool;
pub mod queue;
pub mod report;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheRecord, CachedSession, IdentityCache};
pub use classify::{AttemptResult, FailureKind, classify_send, classify_status};
pub use dispatch::{
    DispatchSettings, Dispatcher, RequestAction, RequestEvent, RequestOutcome, RequestResult,
    RequestState, handle_event,
};
pub use error::{Error, IdentityError, Result};
pub use factory::{FactorySettings, IdentityFactory};
pub use identity::{Identity, PoolEntry, Tag};
pub use pool::{PoolSettings, SessionPool};
pub use queue::WorkQueue;
pub use report::{PoolEvent, RejectReason, Reporter, TracingReporter};
pub use validator::Validator;
