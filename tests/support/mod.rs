//! A minimal in-process [`LockBackend`] used only as shared test
//! harness code. Never exported from `src/` -- this is not a fourth
//! production backend, just enough atomicity to drive the scenario and
//! property tests without a live store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use lockguard::{
    AcquireResult, BackendKind, Capabilities, ExtendResult, LockBackend, LockError, LockInfo,
    LockRecord, LookupBy, MutationOutcome, ReleaseResult,
};

#[derive(Default)]
struct State {
    locks: HashMap<String, LockRecord>,
    fences: HashMap<String, u64>,
}

/// Guarded by a single mutex, matching the spec's single-atomic-section
/// contract: every operation here takes the lock once and releases it
/// before returning.
#[derive(Clone, Default)]
pub struct MockLockBackend {
    state: Arc<Mutex<State>>,
}

pub fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

impl MockLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MockLockBackend {
    async fn acquire(
        &self,
        key: &str,
        ttl_ms: i64,
        cancel: Option<&CancellationToken>,
    ) -> Result<AcquireResult, LockError> {
        if ttl_ms <= 0 {
            return Err(LockError::InvalidArgument("ttlMs must be positive".into()));
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(LockError::Aborted("operation cancelled".into()));
        }

        let mut state = self.state.lock().await;
        let now = now_ms();

        if let Some(existing) = state.locks.get(key) {
            if lockguard::time_authority::is_live_default(existing.expires_at_ms, now) {
                return Ok(AcquireResult::contended());
            }
        }

        let current = *state.fences.get(key).unwrap_or(&0);
        let (_, fence_str) = lockguard::fence::next_fence(current)?;
        state.fences.insert(key.to_string(), current + 1);

        let lock_id = lockguard::key::generate_lock_id();
        let expires_at_ms = now + ttl_ms;
        state.locks.insert(
            key.to_string(),
            LockRecord {
                lock_id: lock_id.clone(),
                key: key.to_string(),
                expires_at_ms,
                acquired_at_ms: now,
                fence: fence_str.clone(),
            },
        );

        Ok(AcquireResult::succeeded(lock_id, expires_at_ms, fence_str))
    }

    async fn release(
        &self,
        lock_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReleaseResult, LockError> {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(LockError::Aborted("operation cancelled".into()));
        }
        let mut state = self.state.lock().await;
        let now = now_ms();

        let Some(key) = find_key_by_lock_id(&state.locks, lock_id) else {
            return Ok(ReleaseResult::from_outcome(MutationOutcome::NeverExisted));
        };
        let record = state.locks.get(&key).expect("just located by key");
        if !lockguard::time_authority::is_live_default(record.expires_at_ms, now) {
            state.locks.remove(&key);
            return Ok(ReleaseResult::from_outcome(MutationOutcome::ObservableExpired));
        }
        state.locks.remove(&key);
        Ok(ReleaseResult::from_outcome(MutationOutcome::Succeeded))
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
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(LockError::Aborted("operation cancelled".into()));
        }
        let mut state = self.state.lock().await;
        let now = now_ms();

        let Some(key) = find_key_by_lock_id(&state.locks, lock_id) else {
            return Ok(ExtendResult::from_failure(MutationOutcome::NeverExisted));
        };
        let live = {
            let record = state.locks.get(&key).expect("just located by key");
            lockguard::time_authority::is_live_default(record.expires_at_ms, now)
        };
        if !live {
            return Ok(ExtendResult::from_failure(MutationOutcome::ObservableExpired));
        }
        let new_expiry = now + ttl_ms;
        state.locks.get_mut(&key).expect("just located by key").expires_at_ms = new_expiry;
        Ok(ExtendResult::succeeded(new_expiry))
    }

    async fn is_locked(&self, key: &str, _cancel: Option<&CancellationToken>) -> Result<bool, LockError> {
        let state = self.state.lock().await;
        Ok(state
            .locks
            .get(key)
            .is_some_and(|r| lockguard::time_authority::is_live_default(r.expires_at_ms, now_ms())))
    }

    async fn lookup(&self, by: LookupBy, _cancel: Option<&CancellationToken>) -> Result<Option<LockInfo>, LockError> {
        let state = self.state.lock().await;
        let record = match by {
            LookupBy::Key(key) => state.locks.get(&key).cloned(),
            LookupBy::LockId(lock_id) => find_key_by_lock_id(&state.locks, &lock_id)
                .and_then(|key| state.locks.get(&key).cloned()),
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
            backend: BackendKind::ScriptedStore,
            supports_fencing: true,
            time_authority: lockguard::time_authority::TimeAuthority::Server,
        }
    }
}

fn find_key_by_lock_id(locks: &HashMap<String, LockRecord>, lock_id: &str) -> Option<String> {
    locks
        .iter()
        .find(|(_, record)| record.lock_id == lock_id)
        .map(|(key, _)| key.clone())
}
