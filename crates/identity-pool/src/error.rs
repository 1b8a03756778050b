//! Error types for pool operations

/// Errors from pool operations and cache persistence.
///
/// Validation failures are not errors: `Validator::validate` collapses them
/// to `false` and the pool simply spends an attempt.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("identity cache error: {0}")]
    Cache(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),
}

/// Why a single `IdentityFactory` attempt produced no identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("control channel failure: {0}")]
    ControlChannel(String),

    #[error("session build failed: {0}")]
    SessionBuild(String),

    #[error("exit address probe failed: {0}")]
    ExitProbe(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
