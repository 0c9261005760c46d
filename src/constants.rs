//! Protocol constants shared by every backend.

/// Maximum caller-key length, in UTF-8 bytes, after NFC normalization.
pub const MAX_KEY_LENGTH_BYTES: usize = 512;

/// Fixed clock-skew tolerance applied to every liveness check.
///
/// Not configurable: the semantics of "expired" must be uniform across
/// backends regardless of which clock authored `now`.
pub const TIME_TOLERANCE_MS: i64 = 1000;

/// Fence values strictly below this are valid; reaching it fails acquire
/// with `LockError::Internal`. ~31.7 years of headroom at 1M acquires/sec.
pub const FENCE_MAX: &str = "900000000000000";

/// 10% of `FENCE_MAX`. Crossing this on acquire logs a warning.
pub const FENCE_WARN: &str = "090000000000000";

/// Default lease duration used by the external auto-retry helper; the
/// core itself never assumes a default and always requires an explicit
/// `ttlMs`.
pub const DEFAULT_TTL_MS: i64 = 30_000;

/// Width of the zero-padded decimal fence string.
pub const FENCE_DIGITS: usize = 15;

/// Extra guard, beyond `TIME_TOLERANCE_MS`, before the relational
/// backend's `isLocked` will opportunistically clean up an expired row.
/// A performance/safety trade-off, not a correctness parameter.
pub const OPPORTUNISTIC_CLEANUP_GUARD_MS: i64 = TIME_TOLERANCE_MS;
