//! Result types returned by [`crate::LockBackend`] operations, and the
//! internal mutation-condition taxonomy they're built from.

use serde::{Deserialize, Serialize};

/// Why a `release` or `extend` failed, as exposed to callers.
///
/// Fine-grained internal conditions (see [`MutationOutcome`]) collapse
/// to this two-variant shape at the public boundary; all ambiguity
/// collapses to `NotFound` -- conservative, fail closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    Expired,
    NotFound,
}

/// The internal, backend-facing taxonomy for why a mutating operation
/// (`release`/`extend`) did or didn't apply. Backends return this;
/// [`MutationOutcome::into_public`] maps it to the public `{ok, reason}`
/// shape. The full variant is also available to a telemetry-only side
/// channel via `tracing::debug!`, never through the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Succeeded,
    ObservableExpired,
    NeverExisted,
    OwnershipMismatch,
    CleanedUpAfterExpiry,
    AmbiguousUnknown,
}

impl MutationOutcome {
    /// Collapses this outcome to the public two-field shape: `(ok,
    /// reason)`. All non-success conditions other than "clearly still
    /// live but contested" map to either `Expired` or `NotFound`; any
    /// ambiguity collapses to `NotFound`.
    pub fn into_public(self) -> (bool, Option<FailureReason>) {
        match self {
            Self::Succeeded => (true, None),
            Self::ObservableExpired | Self::CleanedUpAfterExpiry => (false, Some(FailureReason::Expired)),
            Self::NeverExisted | Self::OwnershipMismatch | Self::AmbiguousUnknown => {
                (false, Some(FailureReason::NotFound))
            }
        }
    }
}

/// Result of `acquire`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fence: Option<String>,
}

impl AcquireResult {
    pub fn succeeded(lock_id: String, expires_at_ms: i64, fence: String) -> Self {
        Self {
            ok: true,
            reason: None,
            lock_id: Some(lock_id),
            expires_at_ms: Some(expires_at_ms),
            fence: Some(fence),
        }
    }

    pub fn contended() -> Self {
        Self {
            ok: false,
            reason: Some("locked"),
            lock_id: None,
            expires_at_ms: None,
            fence: None,
        }
    }
}

/// Result of `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseResult {
    pub ok: bool,
    pub reason: Option<FailureReason>,
}

impl ReleaseResult {
    pub fn from_outcome(outcome: MutationOutcome) -> Self {
        let (ok, reason) = outcome.into_public();
        Self { ok, reason }
    }
}

/// Result of `extend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendResult {
    pub ok: bool,
    pub reason: Option<FailureReason>,
    pub expires_at_ms: Option<i64>,
}

impl ExtendResult {
    pub fn succeeded(expires_at_ms: i64) -> Self {
        Self { ok: true, reason: None, expires_at_ms: Some(expires_at_ms) }
    }

    pub fn from_failure(outcome: MutationOutcome) -> Self {
        let (ok, reason) = outcome.into_public();
        debug_assert!(!ok, "from_failure called with a successful outcome");
        Self { ok, reason, expires_at_ms: None }
    }
}

/// A sanitized snapshot of a live lock, returned by `lookup`.
///
/// Non-atomic by contract -- acceptable for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub lock_id: String,
    pub key: String,
    pub expires_at_ms: i64,
    pub acquired_at_ms: i64,
    pub fence: String,
}
