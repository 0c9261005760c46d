//! The backend-neutral [`LockBackend`] contract.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;
use crate::types::{AcquireResult, Capabilities, ExtendResult, LockInfo, ReleaseResult};

/// Looks up a lock by its caller-facing key, or by the `lockId`
/// returned from a prior `acquire`.
#[derive(Debug, Clone)]
pub enum LookupBy {
    Key(String),
    LockId(String),
}

/// The five operations every backend realizes atop its own storage
/// substrate, plus a static capabilities descriptor.
///
/// Object-safe: usable as `Box<dyn LockBackend>` / `Arc<dyn
/// LockBackend>`. Every method suspends on exactly one atomic store
/// interaction (one script execution or one transaction) -- no
/// cross-call in-process state beyond what the concrete backend caches
/// for its own connection.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Acquires an exclusive lease on `key` for `ttl_ms` milliseconds.
    ///
    /// `key` must already be normalized and length-validated by the
    /// caller (see [`crate::key::normalize_and_validate_key`]); `ttl_ms`
    /// must be positive. On success the assigned fence is strictly
    /// greater than any previous fence for this key.
    async fn acquire(
        &self,
        key: &str,
        ttl_ms: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<AcquireResult, LockError>;

    /// Releases the lease identified by `lock_id`, iff it is still the
    /// live holder for its key.
    async fn release(
        &self,
        lock_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReleaseResult, LockError>;

    /// Atomically validates ownership and liveness of `lock_id`, then
    /// replaces (not adds to) its `expiresAtMs` with `now + ttl_ms`.
    async fn extend(
        &self,
        lock_id: &str,
        ttl_ms: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExtendResult, LockError>;

    /// True iff a live lock currently exists on `key`. Pure diagnostic;
    /// may opportunistically clean up an observably-expired record as a
    /// side effect, per the backend's configured policy.
    async fn is_locked(&self, key: &str, cancel: Option<&CancellationToken>) -> Result<bool, LockError>;

    /// Returns a sanitized snapshot of the live lock addressed by `by`,
    /// or `None`. Non-atomic by contract -- diagnostics only.
    async fn lookup(
        &self,
        by: LookupBy,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<LockInfo>, LockError>;

    /// This backend instance's static capabilities.
    fn capabilities(&self) -> Capabilities;
}

/// Rejects a configured key prefix / fence namespace that would collide
/// with the fence-counter namespace: containing `"fence:"` or ending in
/// `"fence"`.
pub fn validate_key_prefix(prefix: &str) -> Result<(), LockError> {
    if prefix.contains("fence:") || prefix.ends_with("fence") {
        return Err(LockError::InvalidArgument(format!(
            "key prefix {prefix:?} collides with the fence-counter namespace"
        )));
    }
    Ok(())
}

/// Rejects relational/document-store table or collection names that
/// aren't valid identifiers, or that collide the locks and fence tables.
pub fn validate_table_names(locks_table: &str, fence_table: &str) -> Result<(), LockError> {
    for name in [locks_table, fence_table] {
        let valid = !name.is_empty()
            && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(LockError::InvalidArgument(format!(
                "{name:?} is not a valid table/collection identifier"
            )));
        }
    }
    if locks_table == fence_table {
        return Err(LockError::InvalidArgument(
            "the locks table and fence table must be distinct".into(),
        ));
    }
    Ok(())
}
