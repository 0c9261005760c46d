//! Relational backend (`PostgreSQL`-shaped).
//!
//! Two tables, as specified in the persisted layout:
//!
//! - locks: `(key TEXT PK, lock_id TEXT, expires_at_ms BIGINT,
//!   acquired_at_ms BIGINT, fence TEXT, user_key TEXT)`, with a unique
//!   index on `lock_id` and a non-unique index on `expires_at_ms`.
//! - fence counters: `(fence_key TEXT PK, fence BIGINT, key_debug TEXT)`.
//!
//! Every operation runs inside one `deadpool_postgres` transaction.
//! Release/extend look the row up by the `lock_id` secondary index
//! with `SELECT ... FOR UPDATE`; authoritative time is always
//! `SELECT EXTRACT(EPOCH FROM NOW()) * 1000`, read inside the same
//! transaction that writes any new `expiresAtMs`.

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;

use crate::contract::{validate_table_names, LockBackend, LookupBy};
use crate::error::LockError;
use crate::fence::{format_fence, parse_fence};
use crate::key::make_storage_key;
use crate::types::{
    AcquireResult, BackendKind, Capabilities, ExtendResult, LockInfo, MutationOutcome,
    ReleaseResult,
};
use crate::time_authority::TimeAuthority;

const MAX_POSTGRES_KEY_BYTES: usize = 512;

/// Connection and naming configuration for [`PostgresLockBackend`].
#[derive(Debug, Clone)]
pub struct PostgresBackendConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub locks_table: String,
    pub fence_table: String,
    pub key_prefix: String,
    pub max_pool_size: usize,
}

impl Default for PostgresBackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            locks_table: "locks".to_string(),
            fence_table: "lock_fences".to_string(),
            key_prefix: String::new(),
            max_pool_size: 16,
        }
    }
}

impl PostgresBackendConfig {
    /// Reads connection settings from the environment, falling back to
    /// [`PostgresBackendConfig::default`] for anything unset.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            host: std::env::var("LOCKGUARD_PG_HOST").unwrap_or(default.host),
            port: std::env::var("LOCKGUARD_PG_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(default.port),
            dbname: std::env::var("LOCKGUARD_PG_DBNAME").unwrap_or(default.dbname),
            user: std::env::var("LOCKGUARD_PG_USER").unwrap_or(default.user),
            password: std::env::var("LOCKGUARD_PG_PASSWORD").unwrap_or(default.password),
            ..default
        }
    }

    fn create_pool(&self) -> Result<Pool, LockError> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.manager = Some(ManagerConfig { recycling_method: RecyclingMethod::Fast });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(self.max_pool_size));
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| LockError::ServiceUnavailable(format!("failed to create Postgres pool: {e}")))
    }
}

/// Relational ([`LockBackend`]) implementation atop `PostgreSQL`.
#[derive(Clone)]
pub struct PostgresLockBackend {
    pool: Pool,
    locks_table: String,
    fence_table: String,
    key_prefix: String,
}

impl PostgresLockBackend {
    /// Builds the connection pool and validates table-name
    /// configuration, per spec.
    pub async fn connect(config: PostgresBackendConfig) -> Result<Self, LockError> {
        validate_table_names(&config.locks_table, &config.fence_table)?;
        crate::contract::validate_key_prefix(&config.key_prefix)?;
        let pool = config.create_pool()?;
        Ok(Self {
            pool,
            locks_table: config.locks_table,
            fence_table: config.fence_table,
            key_prefix: config.key_prefix,
        })
    }

    /// Derives the `locks.key` / `lock_fences.fence_key` value shared
    /// by both tables for a given caller key -- safe to share since
    /// the two live in separate tables.
    fn storage_key(&self, key: &str) -> String {
        make_storage_key(&self.key_prefix, key, MAX_POSTGRES_KEY_BYTES, 0)
    }
}

fn map_pg_error(err: tokio_postgres::Error) -> LockError {
    if let Some(db_error) = err.as_db_error() {
        use tokio_postgres::error::SqlState;
        return match *db_error.code() {
            SqlState::INVALID_AUTHORIZATION_SPECIFICATION | SqlState::INVALID_PASSWORD => {
                LockError::AuthFailed(db_error.message().to_string())
            }
            SqlState::TOO_MANY_CONNECTIONS => LockError::RateLimited(db_error.message().to_string()),
            _ => LockError::Internal(db_error.message().to_string()),
        };
    }
    if err.is_closed() {
        return LockError::ServiceUnavailable(err.to_string());
    }
    LockError::Internal(err.to_string())
}

fn map_pool_error(err: deadpool_postgres::PoolError) -> LockError {
    LockError::ServiceUnavailable(format!("failed to obtain Postgres connection: {err}"))
}

fn check_cancel(cancel: Option<&CancellationToken>) -> Result<(), LockError> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(LockError::Aborted("cancelled before store round-trip".into()));
    }
    Ok(())
}

#[async_trait]
impl LockBackend for PostgresLockBackend {
    async fn acquire(
        &self,
        key: &str,
        ttl_ms: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<AcquireResult, LockError> {
        if ttl_ms <= 0 {
            return Err(LockError::InvalidArgument("ttlMs must be positive".into()));
        }
        check_cancel(cancel)?;

        let storage_key = self.storage_key(key);
        let fence_key = storage_key.clone();
        let mut client = self.pool.get().await.map_err(map_pool_error)?;
        let txn = client.transaction().await.map_err(map_pg_error)?;

        let now_row = txn
            .query_one("SELECT (EXTRACT(EPOCH FROM NOW()) * 1000)::BIGINT AS now_ms", &[])
            .await
            .map_err(map_pg_error)?;
        let now_ms: i64 = now_row.get("now_ms");

        let existing = txn
            .query_opt(
                &format!("SELECT expires_at_ms FROM {} WHERE key = $1 FOR UPDATE", self.locks_table),
                &[&storage_key],
            )
            .await
            .map_err(map_pg_error)?;
        if let Some(row) = existing {
            let expires_at_ms: i64 = row.get("expires_at_ms");
            if crate::time_authority::is_live_default(expires_at_ms, now_ms) {
                return Ok(AcquireResult::contended());
            }
        }

        let fence_row = txn
            .query_opt(
                &format!("SELECT fence FROM {} WHERE fence_key = $1 FOR UPDATE", self.fence_table),
                &[&fence_key],
            )
            .await
            .map_err(map_pg_error)?;
        let current_fence: i64 = match fence_row {
            Some(row) => parse_fence(row.get::<_, &str>("fence"))? as i64,
            None => 0,
        };
        let next = current_fence + 1;
        let ceiling: i64 = crate::constants::FENCE_MAX.parse().expect("valid literal");
        if next >= ceiling {
            return Err(LockError::Internal(format!(
                "fence counter for {key:?} reached overflow ceiling {}",
                crate::constants::FENCE_MAX
            )));
        }
        let fence_str = format_fence(next as u64);
        let warn: i64 = crate::constants::FENCE_WARN.parse().expect("valid literal");
        if next >= warn {
            tracing::warn!(fence = %fence_str, "fence counter has crossed 10% of its overflow ceiling");
        }

        let lock_id = crate::key::generate_lock_id();
        let expires_at_ms = now_ms + ttl_ms;

        txn.execute(
            &format!(
                "INSERT INTO {} (key, lock_id, expires_at_ms, acquired_at_ms, fence, user_key)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (key) DO UPDATE SET
                    lock_id = EXCLUDED.lock_id,
                    expires_at_ms = EXCLUDED.expires_at_ms,
                    acquired_at_ms = EXCLUDED.acquired_at_ms,
                    fence = EXCLUDED.fence,
                    user_key = EXCLUDED.user_key",
                self.locks_table
            ),
            &[&storage_key, &lock_id, &expires_at_ms, &now_ms, &fence_str, &key],
        )
        .await
        .map_err(map_pg_error)?;

        txn.execute(
            &format!(
                "INSERT INTO {} (fence_key, fence, key_debug) VALUES ($1, $2, $3)
                 ON CONFLICT (fence_key) DO UPDATE SET fence = EXCLUDED.fence",
                self.fence_table
            ),
            &[&fence_key, &fence_str, &key],
        )
        .await
        .map_err(map_pg_error)?;

        txn.commit().await.map_err(map_pg_error)?;

        tracing::debug!(key, lock_id = %lock_id, fence = %fence_str, "acquired lock");
        Ok(AcquireResult::succeeded(lock_id, expires_at_ms, fence_str))
    }

    async fn release(
        &self,
        lock_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReleaseResult, LockError> {
        check_cancel(cancel)?;
        let mut client = self.pool.get().await.map_err(map_pool_error)?;
        let txn = client.transaction().await.map_err(map_pg_error)?;

        let row = txn
            .query_opt(
                &format!("SELECT key, expires_at_ms FROM {} WHERE lock_id = $1 FOR UPDATE", self.locks_table),
                &[&lock_id],
            )
            .await
            .map_err(map_pg_error)?;

        let Some(row) = row else {
            return Ok(ReleaseResult::from_outcome(MutationOutcome::NeverExisted));
        };
        let storage_key: String = row.get("key");
        let expires_at_ms: i64 = row.get("expires_at_ms");

        let now_row = txn
            .query_one("SELECT (EXTRACT(EPOCH FROM NOW()) * 1000)::BIGINT AS now_ms", &[])
            .await
            .map_err(map_pg_error)?;
        let now_ms: i64 = now_row.get("now_ms");

        let outcome = if !crate::time_authority::is_live_default(expires_at_ms, now_ms) {
            MutationOutcome::ObservableExpired
        } else {
            MutationOutcome::Succeeded
        };

        txn.execute(&format!("DELETE FROM {} WHERE key = $1", self.locks_table), &[&storage_key])
            .await
            .map_err(map_pg_error)?;
        txn.commit().await.map_err(map_pg_error)?;

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
        check_cancel(cancel)?;
        let mut client = self.pool.get().await.map_err(map_pool_error)?;
        let txn = client.transaction().await.map_err(map_pg_error)?;

        let row = txn
            .query_opt(
                &format!("SELECT key, expires_at_ms FROM {} WHERE lock_id = $1 FOR UPDATE", self.locks_table),
                &[&lock_id],
            )
            .await
            .map_err(map_pg_error)?;
        let Some(row) = row else {
            return Ok(ExtendResult::from_failure(MutationOutcome::NeverExisted));
        };
        let storage_key: String = row.get("key");
        let expires_at_ms: i64 = row.get("expires_at_ms");

        let now_row = txn
            .query_one("SELECT (EXTRACT(EPOCH FROM NOW()) * 1000)::BIGINT AS now_ms", &[])
            .await
            .map_err(map_pg_error)?;
        let now_ms: i64 = now_row.get("now_ms");

        if !crate::time_authority::is_live_default(expires_at_ms, now_ms) {
            return Ok(ExtendResult::from_failure(MutationOutcome::ObservableExpired));
        }

        let new_expires_at_ms = now_ms + ttl_ms;
        txn.execute(
            &format!("UPDATE {} SET expires_at_ms = $1 WHERE key = $2", self.locks_table),
            &[&new_expires_at_ms, &storage_key],
        )
        .await
        .map_err(map_pg_error)?;
        txn.commit().await.map_err(map_pg_error)?;

        Ok(ExtendResult::succeeded(new_expires_at_ms))
    }

    async fn is_locked(&self, key: &str, cancel: Option<&CancellationToken>) -> Result<bool, LockError> {
        check_cancel(cancel)?;
        let storage_key = self.storage_key(key);
        let client = self.pool.get().await.map_err(map_pool_error)?;

        let now_row = client
            .query_one("SELECT (EXTRACT(EPOCH FROM NOW()) * 1000)::BIGINT AS now_ms", &[])
            .await
            .map_err(map_pg_error)?;
        let now_ms: i64 = now_row.get("now_ms");

        let row = client
            .query_opt(&format!("SELECT expires_at_ms FROM {} WHERE key = $1", self.locks_table), &[&storage_key])
            .await
            .map_err(map_pg_error)?;
        let Some(row) = row else { return Ok(false) };
        let expires_at_ms: i64 = row.get("expires_at_ms");
        if crate::time_authority::is_live_default(expires_at_ms, now_ms) {
            return Ok(true);
        }

        // Opportunistic cleanup: only once expired for at least
        // TIME_TOLERANCE_MS beyond the main tolerance, to avoid racing
        // an in-flight extend. A performance/safety trade-off, not a
        // correctness parameter.
        let cleanup_guard = crate::constants::TIME_TOLERANCE_MS + crate::constants::OPPORTUNISTIC_CLEANUP_GUARD_MS;
        if !crate::time_authority::is_live(expires_at_ms, now_ms, cleanup_guard) {
            let _ = client
                .execute(&format!("DELETE FROM {} WHERE key = $1 AND expires_at_ms = $2", self.locks_table), &[&storage_key, &expires_at_ms])
                .await;
        }
        Ok(false)
    }

    async fn lookup(
        &self,
        by: LookupBy,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<LockInfo>, LockError> {
        check_cancel(cancel)?;
        let client = self.pool.get().await.map_err(map_pool_error)?;

        let row = match by {
            LookupBy::Key(key) => {
                let storage_key = self.storage_key(&key);
                client
                    .query_opt(
                        &format!("SELECT lock_id, user_key, expires_at_ms, acquired_at_ms, fence FROM {} WHERE key = $1", self.locks_table),
                        &[&storage_key],
                    )
                    .await
                    .map_err(map_pg_error)?
            }
            LookupBy::LockId(lock_id) => client
                .query_opt(
                    &format!("SELECT lock_id, user_key, expires_at_ms, acquired_at_ms, fence FROM {} WHERE lock_id = $1", self.locks_table),
                    &[&lock_id],
                )
                .await
                .map_err(map_pg_error)?,
        };

        let Some(row) = row else { return Ok(None) };
        Ok(Some(LockInfo {
            lock_id: row.get("lock_id"),
            key: row.get("user_key"),
            expires_at_ms: row.get("expires_at_ms"),
            acquired_at_ms: row.get("acquired_at_ms"),
            fence: row.get("fence"),
        }))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            backend: BackendKind::Relational,
            supports_fencing: true,
            time_authority: TimeAuthority::Server,
        }
    }
}


/// Feature-gated integration tests against a real `PostgreSQL` instance.
///
/// Requires the two tables described in the module docs to already
/// exist; set `LOCKGUARD_PG_*` env vars to point at a test database.
#[cfg(all(test, feature = "postgres-tests"))]
mod integration_tests {
    use super::*;

    async fn test_backend() -> PostgresLockBackend {
        let mut config = PostgresBackendConfig::from_env();
        config.key_prefix = format!("test-{}:", crate::key::generate_lock_id());
        PostgresLockBackend::connect(config).await.expect("Postgres connection failed")
    }

    #[tokio::test]
    async fn postgres_acquire_then_release_allows_reacquire() {
        let backend = test_backend().await;
        let first = backend.acquire("resource:1", 30_000, None).await.unwrap();
        assert!(first.ok);

        let second = backend.acquire("resource:1", 30_000, None).await.unwrap();
        assert!(!second.ok);

        let release = backend.release(first.lock_id.as_deref().unwrap(), None).await.unwrap();
        assert!(release.ok);

        let third = backend.acquire("resource:1", 30_000, None).await.unwrap();
        assert!(third.ok);
        assert!(third.fence > first.fence);
    }

    #[tokio::test]
    async fn postgres_oversized_key_round_trips_through_lookup() {
        let backend = test_backend().await;
        let long_key = "x".repeat(2000);

        let acquired = backend.acquire(&long_key, 30_000, None).await.unwrap();
        assert!(acquired.ok);

        let info = backend.lookup(LookupBy::Key(long_key.clone()), None).await.unwrap();
        assert!(info.is_some());
        assert_eq!(info.unwrap().key, long_key);
    }
}
