//! Scripted-store backend (Redis-shaped).
//!
//! Atomicity comes from server-side Lua scripts that execute without
//! interleaving. Storage uses three keys per lock:
//!
//! | Key | Purpose |
//! |---|---|
//! | `{prefix}{key}` | JSON-encoded [`LockRecord`] |
//! | `{prefix}id:{lockId}` | reverse index: storage key of the lock record |
//! | `{prefix}fence:{key}` | the [`FenceCounter`], never deleted |
//!
//! The main key and the reverse index share the lock's TTL; the fence
//! counter has no TTL. Server time comes from Redis's own `TIME`
//! command, issued inside each script, satisfying the same-atomic-
//! section time-authority rule.

use ::redis::aio::MultiplexedConnection;
use ::redis::Script;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::contract::{validate_key_prefix, LockBackend, LookupBy};
use crate::domain::LockRecord;
use crate::error::LockError;
use crate::constants::FENCE_WARN;
use crate::key::make_storage_key;
use crate::types::{
    AcquireResult, BackendKind, Capabilities, ExtendResult, LockInfo, MutationOutcome,
    ReleaseResult,
};
use crate::time_authority::TimeAuthority;

/// Bytes reserved for the `id:{lockId}` reverse-index suffix when a key
/// must be truncated to fit the backend's storage-key budget.
const REVERSE_INDEX_RESERVE_BYTES: usize = 26;

const MAX_REDIS_KEY_BYTES: usize = 512;

/// Reads the main key. If present and live, returns `locked`. Else
/// reads and increments the fence counter, writes the new lock record
/// and reverse index with TTL = `ttlMs`, writes the updated fence
/// counter with no TTL.
///
/// KEYS[1] = main key, KEYS[2] = reverse-index key, KEYS[3] = fence key.
/// ARGV[1] = lockId, ARGV[2] = ttlMs, ARGV[3] = caller key (debug),
/// ARGV[4] = tolerance_ms.
/// Returns `{status, fence, expiresAtMs}`: status 1 = acquired, 0 = locked.
const LUA_ACQUIRE: &str = r#"
local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local tolerance_ms = tonumber(ARGV[4])

local existing = redis.call('GET', KEYS[1])
if existing then
    local record = cjson.decode(existing)
    if tonumber(record.expiresAtMs) > now_ms - tolerance_ms then
        return {0, '', 0}
    end
end

local current_fence = redis.call('GET', KEYS[3])
local fence_value
if current_fence then
    fence_value = tonumber(current_fence) + 1
else
    fence_value = 1
end

local ttl_ms = tonumber(ARGV[2])
local expires_at_ms = now_ms + ttl_ms
local fence_str = string.format('%015d', fence_value)

local record = cjson.encode({
    lockId = ARGV[1],
    key = ARGV[3],
    expiresAtMs = expires_at_ms,
    acquiredAtMs = now_ms,
    fence = fence_str,
})

local ttl_seconds = math.ceil(ttl_ms / 1000)
redis.call('SET', KEYS[1], record, 'EX', ttl_seconds)
redis.call('SET', KEYS[2], KEYS[1], 'EX', ttl_seconds)
redis.call('SET', KEYS[3], fence_value)

return {1, fence_value, expires_at_ms}
"#;

/// Dereferences the reverse-index key to find the main key; deletes
/// both iff the stored `lockId` still matches and the record is live.
///
/// KEYS[1] = reverse-index key.
/// ARGV[1] = lockId, ARGV[2] = tolerance_ms.
/// Returns code: 1=success, 0=ownership-mismatch, -1=never-existed,
/// -2=expired.
const LUA_RELEASE: &str = r#"
local main_key = redis.call('GET', KEYS[1])
if not main_key then
    return -1
end

local existing = redis.call('GET', main_key)
if not existing then
    return -1
end

local record = cjson.decode(existing)
if record.lockId ~= ARGV[1] then
    return 0
end

local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local tolerance_ms = tonumber(ARGV[2])
if tonumber(record.expiresAtMs) <= now_ms - tolerance_ms then
    redis.call('DEL', main_key, KEYS[1])
    return -2
end

redis.call('DEL', main_key, KEYS[1])
return 1
"#;

/// Same dereference pattern as release; on success, replaces
/// `expiresAtMs`, resets both keys' TTLs, and returns the new value.
///
/// KEYS[1] = reverse-index key.
/// ARGV[1] = lockId, ARGV[2] = ttlMs, ARGV[3] = tolerance_ms.
/// Returns `{code, expiresAtMs}` with the same code mapping as release.
const LUA_EXTEND: &str = r#"
local main_key = redis.call('GET', KEYS[1])
if not main_key then
    return {-1, 0}
end

local existing = redis.call('GET', main_key)
if not existing then
    return {-1, 0}
end

local record = cjson.decode(existing)
if record.lockId ~= ARGV[1] then
    return {0, 0}
end

local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local tolerance_ms = tonumber(ARGV[3])
if tonumber(record.expiresAtMs) <= now_ms - tolerance_ms then
    return {-2, 0}
end

local ttl_ms = tonumber(ARGV[2])
local new_expires_at_ms = now_ms + ttl_ms
record.expiresAtMs = new_expires_at_ms

local ttl_seconds = math.ceil(ttl_ms / 1000)
redis.call('SET', main_key, cjson.encode(record), 'EX', ttl_seconds)
redis.call('EXPIRE', KEYS[1], ttl_seconds)

return {1, new_expires_at_ms}
"#;

/// Scripted-store ([`LockBackend`]) implementation atop Redis.
///
/// Holds a cheaply-cloneable [`MultiplexedConnection`]; every method
/// clones it before use.
#[derive(Debug, Clone)]
pub struct RedisLockBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
    tolerance_ms: i64,
}

impl RedisLockBackend {
    /// Connects to Redis at `url` with the default key prefix `"lock:"`.
    pub async fn new(url: &str) -> Result<Self, LockError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| LockError::InvalidArgument(format!("invalid Redis URL: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error(e))?;
        Ok(Self {
            conn,
            key_prefix: "lock:".to_string(),
            tolerance_ms: crate::constants::TIME_TOLERANCE_MS,
        })
    }

    /// Builds a backend atop an already-established connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "lock:".to_string(),
            tolerance_ms: crate::constants::TIME_TOLERANCE_MS,
        }
    }

    /// Overrides the key prefix (builder pattern). Rejected at call
    /// time if it would collide with the fence-counter namespace.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Result<Self, LockError> {
        let prefix = prefix.into();
        validate_key_prefix(&prefix)?;
        self.key_prefix = prefix;
        Ok(self)
    }

    fn main_key(&self, key: &str) -> String {
        main_key_for(&self.key_prefix, key)
    }

    fn reverse_index_key(&self, lock_id: &str) -> String {
        reverse_index_key_for(&self.key_prefix, lock_id)
    }

    fn fence_key(&self, key: &str) -> String {
        fence_key_for(&self.key_prefix, key)
    }
}

fn main_key_for(prefix: &str, key: &str) -> String {
    make_storage_key(prefix, key, MAX_REDIS_KEY_BYTES, 0)
}

fn reverse_index_key_for(prefix: &str, lock_id: &str) -> String {
    format!("{prefix}id:{lock_id}")
}

fn fence_key_for(prefix: &str, key: &str) -> String {
    let storage_key = make_storage_key(prefix, key, MAX_REDIS_KEY_BYTES, REVERSE_INDEX_RESERVE_BYTES);
    format!("{prefix}fence:{}", &storage_key[prefix.len()..])
}

fn map_redis_error(err: ::redis::RedisError) -> LockError {
    let msg = err.to_string();
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        if err.is_timeout() {
            return LockError::NetworkTimeout(msg);
        }
        return LockError::ServiceUnavailable(msg);
    }
    if msg.contains("NOAUTH") || msg.contains("WRONGPASS") {
        return LockError::AuthFailed(msg);
    }
    if msg.contains("rate limit") || msg.contains("OOM") {
        return LockError::RateLimited(msg);
    }
    LockError::Internal(msg)
}

fn check_cancel(cancel: Option<&CancellationToken>) -> Result<(), LockError> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(LockError::Aborted("cancelled before store round-trip".into()));
    }
    Ok(())
}

#[async_trait]
impl LockBackend for RedisLockBackend {
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

        let main_key = self.main_key(key);
        let lock_id = crate::key::generate_lock_id();
        let reverse_key = self.reverse_index_key(&lock_id);
        let fence_key = self.fence_key(key);

        let mut conn = self.conn.clone();
        let result: Vec<i64> = Script::new(LUA_ACQUIRE)
            .key(&main_key)
            .key(&reverse_key)
            .key(&fence_key)
            .arg(&lock_id)
            .arg(ttl_ms)
            .arg(key)
            .arg(self.tolerance_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let status = result.first().copied().unwrap_or(0);
        if status == 0 {
            return Ok(AcquireResult::contended());
        }
        let fence_value = *result.get(1).ok_or_else(|| LockError::Internal("malformed acquire script result".into()))?;
        let expires_at_ms = *result.get(2).ok_or_else(|| LockError::Internal("malformed acquire script result".into()))?;
        if fence_value < 0 {
            return Err(LockError::Internal("fence counter returned negative value".into()));
        }
        let ceiling: i64 = crate::constants::FENCE_MAX
            .parse()
            .expect("FENCE_MAX is a valid i64 literal");
        if fence_value >= ceiling {
            return Err(LockError::Internal(format!(
                "fence counter for {key:?} reached overflow ceiling {}",
                crate::constants::FENCE_MAX
            )));
        }
        let fence_str = crate::fence::format_fence(fence_value as u64);
        warn_if_approaching_fence_ceiling(&fence_str);
        tracing::debug!(key, lock_id = %lock_id, fence = %fence_str, "acquired lock");
        Ok(AcquireResult::succeeded(lock_id, expires_at_ms, fence_str))
    }

    async fn release(
        &self,
        lock_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReleaseResult, LockError> {
        check_cancel(cancel)?;
        let reverse_key = self.reverse_index_key(lock_id);
        let mut conn = self.conn.clone();
        let code: i64 = Script::new(LUA_RELEASE)
            .key(&reverse_key)
            .arg(lock_id)
            .arg(self.tolerance_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(ReleaseResult::from_outcome(outcome_from_code(code)))
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
        let reverse_key = self.reverse_index_key(lock_id);
        let mut conn = self.conn.clone();
        let result: Vec<i64> = Script::new(LUA_EXTEND)
            .key(&reverse_key)
            .arg(lock_id)
            .arg(ttl_ms)
            .arg(self.tolerance_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let code = result.first().copied().unwrap_or(-1);
        if code != 1 {
            return Ok(ExtendResult::from_failure(outcome_from_code(code)));
        }
        let expires_at_ms = *result.get(1).ok_or_else(|| LockError::Internal("malformed extend script result".into()))?;
        Ok(ExtendResult::succeeded(expires_at_ms))
    }

    async fn is_locked(&self, key: &str, cancel: Option<&CancellationToken>) -> Result<bool, LockError> {
        Ok(self.lookup(LookupBy::Key(key.to_string()), cancel).await?.is_some())
    }

    async fn lookup(
        &self,
        by: LookupBy,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<LockInfo>, LockError> {
        check_cancel(cancel)?;
        let mut conn = self.conn.clone();

        let raw: Option<String> = match by {
            LookupBy::Key(key) => {
                let main_key = self.main_key(&key);
                ::redis::AsyncCommands::get(&mut conn, &main_key).await.map_err(map_redis_error)?
            }
            LookupBy::LockId(lock_id) => {
                let reverse_key = self.reverse_index_key(&lock_id);
                let main_key: Option<String> =
                    ::redis::AsyncCommands::get(&mut conn, &reverse_key).await.map_err(map_redis_error)?;
                match main_key {
                    Some(main_key) => {
                        ::redis::AsyncCommands::get(&mut conn, &main_key).await.map_err(map_redis_error)?
                    }
                    None => None,
                }
            }
        };

        let Some(raw) = raw else { return Ok(None) };
        let record: LockRecord = serde_json::from_str(&raw)
            .map_err(|e| LockError::Internal(format!("malformed lock record: {e}")))?;
        Ok(Some(LockInfo {
            lock_id: record.lock_id,
            key: record.key,
            expires_at_ms: record.expires_at_ms,
            acquired_at_ms: record.acquired_at_ms,
            fence: record.fence,
        }))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            backend: BackendKind::ScriptedStore,
            supports_fencing: true,
            time_authority: TimeAuthority::Server,
        }
    }
}

fn warn_if_approaching_fence_ceiling(fence: &str) {
    if fence >= FENCE_WARN {
        tracing::warn!(fence, "fence counter has crossed 10% of its overflow ceiling");
    }
}

fn outcome_from_code(code: i64) -> MutationOutcome {
    match code {
        1 => MutationOutcome::Succeeded,
        0 => MutationOutcome::OwnershipMismatch,
        -2 => MutationOutcome::ObservableExpired,
        _ => MutationOutcome::NeverExisted,
    }
}
