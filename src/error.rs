//! The shared error taxonomy raised across every backend.
//!
//! Domain failures — contention, missing lock, expired lock, ownership
//! mismatch — are values (`{ok: false, ..}` result variants), never
//! errors. Only environmental and programmer errors are raised through
//! [`LockError`].

use thiserror::Error;

/// Errors raised by a [`crate::LockBackend`] operation.
///
/// Backend-native errors are mapped onto this taxonomy by each
/// backend's `map_*_error` function (string-pattern based, since the
/// native error surfaces carry human-readable codes inside messages
/// rather than a stable typed enum).
#[derive(Debug, Error)]
pub enum LockError {
    /// The underlying store is unreachable, or reported a transient
    /// conflict that the caller may retry.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Authentication against the underlying store failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A caller-supplied argument was invalid: bad key, bad ttl, bad
    /// lockId format, or a configuration violation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The underlying store rate-limited this operation.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// An underlying transport operation exceeded its deadline.
    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    /// The external auto-retry helper's retry loop exhausted. Never
    /// raised by the core itself; reserved for that collaborator.
    #[error("acquisition timed out after exhausting retries: {0}")]
    AcquisitionTimeout(String),

    /// The operation was cancelled via its cancellation signal.
    #[error("operation aborted: {0}")]
    Aborted(String),

    /// Fence overflow, a malformed script/transaction result, or any
    /// native error this backend could not map to a more specific kind.
    #[error("internal error: {0}")]
    Internal(String),
}
