//! Engine error model
//!
//! Defines a typed error hierarchy using `thiserror` shared by every module.
//! Connection-health faults are recovered locally by the pool; invariant
//! violations get their own variant so callers can tell them apart from
//! transient network trouble.

use thiserror::Error;

/// Engine error type
///
/// Covers all error cases the pool and search engine may encounter.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (mailbox, message)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (bad credentials, login rejected)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Connection fault (TCP, TLS, dead session, protocol transport)
    #[error("connection error: {0}")]
    Connection(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Connection pool at capacity under the fail-fast policy
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Pool invariant violation (e.g. releasing an unknown handle).
    /// Fatal to the operation that triggered it, never to the process.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type EngineResult<T> = Result<T, EngineError>;
