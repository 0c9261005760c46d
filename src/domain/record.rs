//! [`LockRecord`] and [`FenceCounter`] -- the persisted shapes of a
//! live lock and its associated fence counter, independent of any
//! backend's wire/column encoding.

use serde::{Deserialize, Serialize};

/// One live lock, keyed by a derived storage key.
///
/// Created by `acquire`, mutated only by `extend` (which replaces
/// `expires_at_ms`), and deleted by `release` or passive expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Unique to this lease; generated at acquisition.
    pub lock_id: String,
    /// The caller-supplied, NFC-normalized lock name, preserved
    /// verbatim for debugging.
    pub key: String,
    /// Absolute wall-clock expiry in milliseconds.
    pub expires_at_ms: i64,
    /// Absolute wall-clock timestamp of acquisition.
    pub acquired_at_ms: i64,
    /// 15-digit zero-padded decimal string.
    pub fence: String,
}

/// Per-key monotonic counter. One per logical key, persistent: never
/// deleted even after the lock is released, so fences remain strictly
/// increasing across the entire key's lifetime including release/
/// re-acquire cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FenceCounter {
    /// Current value, zero-padded 15-digit decimal.
    pub fence: String,
    /// Raw caller key, diagnostic only.
    pub key_debug: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_record_round_trips_through_json() {
        let record = LockRecord {
            lock_id: "abc".into(),
            key: "resource:1".into(),
            expires_at_ms: 1_000,
            acquired_at_ms: 500,
            fence: "000000000000001".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"lockId\""));
        assert!(json.contains("\"expiresAtMs\""));
        let back: LockRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn fence_counter_round_trips_through_json() {
        let counter = FenceCounter {
            fence: "000000000000003".into(),
            key_debug: "resource:1".into(),
        };
        let json = serde_json::to_string(&counter).unwrap();
        assert!(json.contains("\"keyDebug\""));
        let back: FenceCounter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, counter);
    }
}
