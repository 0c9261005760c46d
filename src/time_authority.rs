//! The liveness predicate and the per-backend notion of "now".

use crate::constants::TIME_TOLERANCE_MS;

/// Which clock a backend trusts for liveness checks and new-expiry
/// writes. Exposed via `Capabilities` so callers correlating fences
/// across backends know the two are separate serial lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeAuthority {
    /// Time is read from the store itself inside the atomic section
    /// (Redis `TIME`, `SELECT EXTRACT(EPOCH FROM NOW())`).
    Server,
    /// Time is read from the local process clock inside the
    /// transaction callback (document-store backend).
    Client,
}

/// `expiresAtMs > nowMs - toleranceMs`.
///
/// The subtraction grants the benefit of the doubt when clocks disagree
/// by up to `toleranceMs`. Callers must pass the same `nowMs` that fed
/// (or will feed) any write of `expiresAtMs` in the same atomic
/// operation — never a value read outside that section.
pub fn is_live(expires_at_ms: i64, now_ms: i64, tolerance_ms: i64) -> bool {
    expires_at_ms > now_ms - tolerance_ms
}

/// `is_live` with the crate's fixed `TIME_TOLERANCE_MS`.
pub fn is_live_default(expires_at_ms: i64, now_ms: i64) -> bool {
    is_live(expires_at_ms, now_ms, TIME_TOLERANCE_MS)
}
