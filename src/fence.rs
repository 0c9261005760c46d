//! Fence-counter formatting, parsing, and overflow policy.

use crate::constants::{FENCE_DIGITS, FENCE_MAX, FENCE_WARN};
use crate::error::LockError;

/// Formats a fence value as a zero-padded 15-digit decimal string.
///
/// Lexicographic ordering of the string matches numeric ordering, and
/// the maximum fits inside a 53-bit float (relevant to the
/// scripted-store backend's scripting runtime).
pub fn format_fence(value: u64) -> String {
    format!("{value:0width$}", width = FENCE_DIGITS)
}

/// Parses a 15-digit zero-padded fence string back into its numeric
/// value. Returns `LockError::Internal` on malformed input — this
/// indicates store corruption or a bug upstream, not a caller error.
pub fn parse_fence(fence: &str) -> Result<u64, LockError> {
    if fence.len() != FENCE_DIGITS || !fence.bytes().all(|b| b.is_ascii_digit()) {
        return Err(LockError::Internal(format!("malformed fence value: {fence:?}")));
    }
    fence
        .parse::<u64>()
        .map_err(|e| LockError::Internal(format!("fence value out of range: {e}")))
}

/// The next fence counter given the current stored value (0 if the key
/// has never been acquired). Fails with `LockError::Internal` once the
/// next value would reach `FENCE_MAX`; logs a warning once it crosses
/// `FENCE_WARN` (10% of capacity).
pub fn next_fence(current: u64) -> Result<(u64, String), LockError> {
    let next = current + 1;
    let formatted = format_fence(next);
    let max = FENCE_MAX.parse::<u64>().expect("FENCE_MAX is a valid u64 literal");
    if next >= max {
        return Err(LockError::Internal(format!(
            "fence counter reached overflow ceiling {FENCE_MAX}"
        )));
    }
    let warn = FENCE_WARN.parse::<u64>().expect("FENCE_WARN is a valid u64 literal");
    if next >= warn {
        tracing::warn!(fence = %formatted, "fence counter has crossed 10% of its overflow ceiling");
    }
    Ok((next, formatted))
}
