//! Document-store backend (Firestore-shaped).
//!
//! One document per lock, keyed by the derived storage key, in the
//! locks collection; one document per fence counter at
//! `fence:{storageKey}` in the fence-counters collection. Looking up a
//! lock by `lockId` requires an externally-configured composite index
//! on that field (not something this crate can create).
//!
//! Firestore-style transactions require all reads to precede all
//! writes and automatically retry the callback on any raised error.
//! That retry behavior is exactly why cancellation and internal
//! failures need a dedicated, non-retryable marker (see
//! [`non_retryable`]): without it, a cancelled or permanently-failing
//! operation would retry forever.

use async_trait::async_trait;
use firestore::{FirestoreDb, FirestoreDbOptions};
use tokio_util::sync::CancellationToken;

use crate::contract::{validate_key_prefix, validate_table_names, LockBackend, LookupBy};
use crate::domain::{FenceCounter, LockRecord};
use crate::error::LockError;
use crate::fence::parse_fence;
use crate::key::make_storage_key;
use crate::types::{
    AcquireResult, BackendKind, Capabilities, ExtendResult, LockInfo, MutationOutcome,
    ReleaseResult,
};
use crate::time_authority::TimeAuthority;

const MAX_FIRESTORE_KEY_BYTES: usize = 1500;

/// Prefix embedded in an error message to mark it as originating from
/// this crate's own logic (cancellation, fence overflow, malformed
/// stored data) rather than Firestore itself. Firestore's transaction
/// layer retries the callback on any raised error; without a way to
/// recognize and unwrap these, a cancelled or permanently-failing
/// operation would retry forever and the caller would never see the
/// real reason.
const NON_RETRYABLE_MARKER: &str = "__lockguard_nonretryable__";

/// Wraps a [`LockError`] so it survives the round trip through
/// Firestore's transaction retry machinery: the variant name and
/// message are encoded into the error string, and [`map_fs_error`]
/// decodes them back out rather than re-deriving a generic error kind.
fn non_retryable(err: LockError) -> firestore::errors::FirestoreError {
    let tag = match &err {
        LockError::ServiceUnavailable(_) => "ServiceUnavailable",
        LockError::AuthFailed(_) => "AuthFailed",
        LockError::InvalidArgument(_) => "InvalidArgument",
        LockError::RateLimited(_) => "RateLimited",
        LockError::NetworkTimeout(_) => "NetworkTimeout",
        LockError::AcquisitionTimeout(_) => "AcquisitionTimeout",
        LockError::Aborted(_) => "Aborted",
        LockError::Internal(_) => "Internal",
    };
    let encoded = format!("{NON_RETRYABLE_MARKER}{tag}:{err}");
    firestore::errors::FirestoreError::SystemError(firestore::errors::FirestoreSystemError::new(
        firestore::errors::FirestoreErrorPublicGenericDetails::new("lockguard".to_string()),
        encoded,
    ))
}

fn decode_non_retryable(message: &str) -> Option<LockError> {
    let rest = message.strip_prefix(NON_RETRYABLE_MARKER)?;
    let (tag, detail) = rest.split_once(':')?;
    let detail = detail.to_string();
    Some(match tag {
        "ServiceUnavailable" => LockError::ServiceUnavailable(detail),
        "AuthFailed" => LockError::AuthFailed(detail),
        "InvalidArgument" => LockError::InvalidArgument(detail),
        "RateLimited" => LockError::RateLimited(detail),
        "NetworkTimeout" => LockError::NetworkTimeout(detail),
        "AcquisitionTimeout" => LockError::AcquisitionTimeout(detail),
        "Aborted" => LockError::Aborted(detail),
        _ => LockError::Internal(detail),
    })
}

fn check_cancel_non_retryable(cancel: Option<&CancellationToken>) -> Result<(), firestore::errors::FirestoreError> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(non_retryable(LockError::Aborted("operation cancelled".into())));
    }
    Ok(())
}

/// Connection configuration for [`FirestoreLockBackend`].
#[derive(Debug, Clone)]
pub struct FirestoreBackendConfig {
    pub project_id: String,
    pub locks_collection: String,
    pub fence_collection: String,
    pub key_prefix: String,
}

impl FirestoreBackendConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            locks_collection: "locks".to_string(),
            fence_collection: "lock_fences".to_string(),
            key_prefix: String::new(),
        }
    }
}

/// Document-store ([`LockBackend`]) implementation atop Firestore.
///
/// Local-clock time authority: `now` is captured once at the top of
/// each transaction callback and threaded through both the liveness
/// check and any new `expiresAtMs` write, since Firestore offers no
/// server-time read inside a transaction.
#[derive(Clone)]
pub struct FirestoreLockBackend {
    db: FirestoreDb,
    locks_collection: String,
    fence_collection: String,
    key_prefix: String,
}

impl FirestoreLockBackend {
    pub async fn connect(config: FirestoreBackendConfig) -> Result<Self, LockError> {
        validate_key_prefix(&config.key_prefix)?;
        validate_table_names(&config.locks_collection, &config.fence_collection)?;
        let db = FirestoreDb::with_options(
            FirestoreDbOptions::new(config.project_id.clone()),
        )
        .await
        .map_err(map_fs_error)?;
        Ok(Self {
            db,
            locks_collection: config.locks_collection,
            fence_collection: config.fence_collection,
            key_prefix: config.key_prefix,
        })
    }

    fn storage_key(&self, key: &str) -> String {
        make_storage_key(&self.key_prefix, key, MAX_FIRESTORE_KEY_BYTES, 0)
    }
}

fn map_fs_error(err: firestore::errors::FirestoreError) -> LockError {
    let msg = err.to_string();
    if let Some(decoded) = decode_non_retryable(&msg) {
        return decoded;
    }
    match err {
        firestore::errors::FirestoreError::DatabaseError(_) => LockError::ServiceUnavailable(msg),
        firestore::errors::FirestoreError::DeserializeError(_)
        | firestore::errors::FirestoreError::SerializeError(_) => LockError::Internal(msg),
        firestore::errors::FirestoreError::InvalidParametersError(_) => LockError::InvalidArgument(msg),
        _ => LockError::Internal(msg),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl LockBackend for FirestoreLockBackend {
    async fn acquire(
        &self,
        key: &str,
        ttl_ms: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<AcquireResult, LockError> {
        if ttl_ms <= 0 {
            return Err(LockError::InvalidArgument("ttlMs must be positive".into()));
        }
        let storage_key = self.storage_key(key);
        let fence_key = format!("fence:{storage_key}");
        let locks_collection = self.locks_collection.clone();
        let fence_collection = self.fence_collection.clone();
        let key_owned = key.to_string();
        let cancel = cancel.cloned();

        let outcome = self
            .db
            .run_transaction(move |db, _transaction| {
                let locks_collection = locks_collection.clone();
                let fence_collection = fence_collection.clone();
                let storage_key = storage_key.clone();
                let fence_key = fence_key.clone();
                let key_owned = key_owned.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    check_cancel_non_retryable(cancel.as_ref())?;

                    // Local-clock time authority, captured once and
                    // threaded through both the liveness check and the
                    // new expiresAtMs below -- Firestore has no
                    // server-time read inside a transaction.
                    let now = now_ms();

                    let existing: Option<LockRecord> = db
                        .fluent()
                        .select()
                        .by_id_in(&locks_collection)
                        .obj()
                        .one(&storage_key)
                        .await?;
                    if let Some(record) = &existing {
                        if crate::time_authority::is_live_default(record.expires_at_ms, now) {
                            return Ok(None);
                        }
                    }

                    let fence_counter: Option<FenceCounter> = db
                        .fluent()
                        .select()
                        .by_id_in(&fence_collection)
                        .obj()
                        .one(&fence_key)
                        .await?;
                    let current = match &fence_counter {
                        Some(counter) => parse_fence(&counter.fence).map_err(non_retryable)?,
                        None => 0,
                    };
                    let (_, fence_str) = crate::fence::next_fence(current).map_err(non_retryable)?;

                    let lock_id = crate::key::generate_lock_id();
                    let expires_at_ms = now + ttl_ms;
                    let record = LockRecord {
                        lock_id: lock_id.clone(),
                        key: key_owned.clone(),
                        expires_at_ms,
                        acquired_at_ms: now,
                        fence: fence_str.clone(),
                    };

                    db.fluent()
                        .update()
                        .in_col(&locks_collection)
                        .document_id(&storage_key)
                        .object(&record)
                        .execute::<LockRecord>()
                        .await?;

                    let counter = FenceCounter { fence: fence_str.clone(), key_debug: key_owned.clone() };
                    db.fluent()
                        .update()
                        .in_col(&fence_collection)
                        .document_id(&fence_key)
                        .object(&counter)
                        .execute::<FenceCounter>()
                        .await?;

                    Ok(Some((lock_id, expires_at_ms, fence_str)))
                })
            })
            .await
            .map_err(map_fs_error)?;

        match outcome {
            Some((lock_id, expires_at_ms, fence)) => {
                tracing::debug!(key, lock_id = %lock_id, fence = %fence, "acquired lock");
                Ok(AcquireResult::succeeded(lock_id, expires_at_ms, fence))
            }
            None => Ok(AcquireResult::contended()),
        }
    }

    async fn release(
        &self,
        lock_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReleaseResult, LockError> {
        let outcome = self.mutate_by_lock_id(lock_id, cancel, |_now, _record| None).await?;
        Ok(ReleaseResult::from_outcome(outcome))
    }

    async fn extend(
        &self,
        lock_id: &str,
        ttl_ms: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<ExtendResult, LockError> {
        if ttl_ms <= 0 {
            return Err(LockError::InvalidArgument("ttlMs must be positive".into()));
        }
        let mut new_expiry = None;
        let outcome = self
            .mutate_by_lock_id(lock_id, cancel, |now, record| {
                let expires = now + ttl_ms;
                new_expiry = Some(expires);
                Some(LockRecord { expires_at_ms: expires, ..record.clone() })
            })
            .await?;
        if outcome == MutationOutcome::Succeeded {
            Ok(ExtendResult::succeeded(new_expiry.expect("set on success path")))
        } else {
            Ok(ExtendResult::from_failure(outcome))
        }
    }

    async fn is_locked(&self, key: &str, cancel: Option<&CancellationToken>) -> Result<bool, LockError> {
        Ok(self.lookup(LookupBy::Key(key.to_string()), cancel).await?.is_some())
    }

    async fn lookup(
        &self,
        by: LookupBy,
        _cancel: Option<&CancellationToken>,
    ) -> Result<Option<LockInfo>, LockError> {
        let record: Option<LockRecord> = match by {
            LookupBy::Key(key) => {
                let storage_key = self.storage_key(&key);
                self.db
                    .fluent()
                    .select()
                    .by_id_in(&self.locks_collection)
                    .obj()
                    .one(&storage_key)
                    .await
                    .map_err(map_fs_error)?
            }
            LookupBy::LockId(lock_id) => {
                // Requires an externally-configured composite index on
                // `lockId`. Queries without a row limit so duplicate
                // live holders can be detected (see below).
                let mut live: Vec<LockRecord> = self
                    .db
                    .fluent()
                    .select()
                    .from(self.locks_collection.as_str())
                    .filter(|q| q.for_all([q.field("lockId").eq(&lock_id)]))
                    .obj()
                    .query()
                    .await
                    .map_err(map_fs_error)?;

                let now = now_ms();
                let live_count_before = live.len();
                live.retain(|record| crate::time_authority::is_live_default(record.expires_at_ms, now));
                if live_count_before > 1 && live.len() > 1 {
                    tracing::warn!(
                        lock_id = %lock_id,
                        live_count = live.len(),
                        "duplicate live lock records share a lockId; failing closed"
                    );
                    return Ok(None);
                }
                live.into_iter().next()
            }
        };

        Ok(record.map(|r| LockInfo {
            lock_id: r.lock_id,
            key: r.key,
            expires_at_ms: r.expires_at_ms,
            acquired_at_ms: r.acquired_at_ms,
            fence: r.fence,
        }))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            backend: BackendKind::DocumentStore,
            supports_fencing: true,
            time_authority: TimeAuthority::Client,
        }
    }
}

impl FirestoreLockBackend {
    /// Shared read-then-write pattern for `release`/`extend`: look up
    /// the live record(s) by `lockId` without a row limit (so
    /// duplicate-holder detection works), verify ownership and
    /// liveness, then apply `mutate` (returning `None` to delete,
    /// `Some(record)` to overwrite).
    async fn mutate_by_lock_id(
        &self,
        lock_id: &str,
        cancel: Option<&CancellationToken>,
        mutate: impl Fn(i64, &LockRecord) -> Option<LockRecord> + Send + Sync + 'static,
    ) -> Result<MutationOutcome, LockError> {
        let locks_collection = self.locks_collection.clone();
        let key_prefix = self.key_prefix.clone();
        let lock_id = lock_id.to_string();
        let cancel = cancel.cloned();

        self.db
            .run_transaction(move |db, _transaction| {
                let locks_collection = locks_collection.clone();
                let key_prefix = key_prefix.clone();
                let lock_id = lock_id.clone();
                let cancel = cancel.clone();
                let mutate = &mutate;
                Box::pin(async move {
                    check_cancel_non_retryable(cancel.as_ref())?;

                    let mut candidates: Vec<LockRecord> = db
                        .fluent()
                        .select()
                        .from(locks_collection.as_str())
                        .filter(|q| q.for_all([q.field("lockId").eq(&lock_id)]))
                        .obj()
                        .query()
                        .await?;

                    if candidates.is_empty() {
                        return Ok(MutationOutcome::NeverExisted);
                    }

                    let now = now_ms();
                    candidates.retain(|r| r.lock_id == lock_id);

                    // Opportunistic cleanup of expired duplicates
                    // sharing this lockId, in the same transaction.
                    let mut live: Vec<&LockRecord> = Vec::new();
                    for record in &candidates {
                        if crate::time_authority::is_live_default(record.expires_at_ms, now) {
                            live.push(record);
                        }
                    }

                    if live.len() > 1 {
                        tracing::warn!(
                            lock_id = %lock_id,
                            live_count = live.len(),
                            "duplicate live lock records share a lockId; failing closed"
                        );
                        return Ok(MutationOutcome::AmbiguousUnknown);
                    }

                    let Some(record) = live.into_iter().next() else {
                        return Ok(MutationOutcome::ObservableExpired);
                    };

                    let doc_id = make_storage_key(&key_prefix, &record.key, MAX_FIRESTORE_KEY_BYTES, 0);
                    match mutate(now, record) {
                        Some(updated) => {
                            db.fluent()
                                .update()
                                .in_col(&locks_collection)
                                .document_id(&doc_id)
                                .object(&updated)
                                .execute::<LockRecord>()
                                .await?;
                        }
                        None => {
                            db.fluent()
                                .delete()
                                .from(locks_collection.as_str())
                                .document_id(&doc_id)
                                .execute()
                                .await?;
                        }
                    }
                    Ok(MutationOutcome::Succeeded)
                })
            })
            .await
            .map_err(map_fs_error)
    }
}


/// Feature-gated integration tests against a real Firestore project
/// (or the Firestore emulator via `FIRESTORE_EMULATOR_HOST`).
#[cfg(all(test, feature = "firestore-tests"))]
mod integration_tests {
    use super::*;

    async fn test_backend() -> FirestoreLockBackend {
        let project_id = std::env::var("LOCKGUARD_FIRESTORE_PROJECT_ID")
            .expect("LOCKGUARD_FIRESTORE_PROJECT_ID must be set for Firestore integration tests");
        let mut config = FirestoreBackendConfig::new(project_id);
        config.key_prefix = format!("test-{}:", crate::key::generate_lock_id());
        FirestoreLockBackend::connect(config).await.expect("Firestore connection failed")
    }

    #[tokio::test]
    async fn firestore_acquire_then_release_allows_reacquire() {
        let backend = test_backend().await;
        let first = backend.acquire("resource:1", 30_000, None).await.unwrap();
        assert!(first.ok);

        let second = backend.acquire("resource:1", 30_000, None).await.unwrap();
        assert!(!second.ok);

        let release = backend.release(first.lock_id.as_deref().unwrap(), None).await.unwrap();
        assert!(release.ok);
    }

    #[tokio::test]
    async fn firestore_oversized_key_round_trips_through_lookup() {
        let backend = test_backend().await;
        let long_key = "x".repeat(2000);

        let acquired = backend.acquire(&long_key, 30_000, None).await.unwrap();
        assert!(acquired.ok);

        let info = backend.lookup(LookupBy::Key(long_key.clone()), None).await.unwrap();
        assert!(info.is_some());
        assert_eq!(info.unwrap().key, long_key);
    }
}
