//! Lock-ID generation and caller-key normalization/derivation.

use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::constants::MAX_KEY_LENGTH_BYTES;
use crate::error::LockError;

/// Number of hex characters of `SHA-256(key)` appended when a key must
/// be truncated to fit a backend's storage-key budget.
const TRUNCATION_TAG_HEX_LEN: usize = 16;

/// Draws 16 CSPRNG bytes and encodes them as a 22-character base64url
/// string (no padding), matching `^[A-Za-z0-9_-]{22}$`.
pub fn generate_lock_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// NFC-normalizes `key` and rejects empty or over-length input.
///
/// `"café"` and `"cafe\u{0301}"` normalize to the same bytes, so they
/// collide as intended.
pub fn normalize_and_validate_key(key: &str) -> Result<String, LockError> {
    if key.is_empty() {
        return Err(LockError::InvalidArgument("key must not be empty".into()));
    }
    let normalized: String = key.nfc().collect();
    if normalized.len() > MAX_KEY_LENGTH_BYTES {
        return Err(LockError::InvalidArgument(format!(
            "key exceeds {MAX_KEY_LENGTH_BYTES} bytes after NFC normalization"
        )));
    }
    Ok(normalized)
}

/// Derives a bounded storage key from a normalized caller key.
///
/// If `prefix + key` fits within `limit_bytes - reserve_bytes`, it is
/// returned verbatim. Otherwise `key` is truncated to leave room for a
/// deterministic tag (`TRUNCATION_TAG_HEX_LEN` hex chars of
/// `SHA-256(key)`), so two inputs differing only after the cut point
/// still map to different storage keys.
pub fn make_storage_key(prefix: &str, key: &str, limit_bytes: usize, reserve_bytes: usize) -> String {
    let budget = limit_bytes.saturating_sub(reserve_bytes);
    let whole = format!("{prefix}{key}");
    if whole.len() <= budget {
        return whole;
    }

    let tag = hex_digest_prefix(key, TRUNCATION_TAG_HEX_LEN);
    let fixed_len = prefix.len() + tag.len();
    let room_for_key = budget.saturating_sub(fixed_len);
    let truncated = truncate_to_char_boundary(key, room_for_key);
    format!("{prefix}{truncated}{tag}")
}

fn hex_digest_prefix(input: &str, hex_len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let full_hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    full_hex[..hex_len.min(full_hex.len())].to_string()
}

fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_lock_id_has_expected_length_and_alphabet() {
        let id = generate_lock_id();
        assert_eq!(id.len(), 22);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn generate_lock_id_is_not_constant() {
        let a = generate_lock_id();
        let b = generate_lock_id();
        assert_ne!(a, b);
    }

    #[test]
    fn normalize_and_validate_key_rejects_empty() {
        assert!(normalize_and_validate_key("").is_err());
    }

    #[test]
    fn normalize_and_validate_key_rejects_over_length() {
        let huge = "a".repeat(MAX_KEY_LENGTH_BYTES + 1);
        assert!(normalize_and_validate_key(&huge).is_err());
    }

    #[test]
    fn normalize_and_validate_key_collapses_nfc_equivalents() {
        let a = normalize_and_validate_key("café").unwrap();
        let b = normalize_and_validate_key("cafe\u{0301}").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn make_storage_key_passes_through_when_it_fits() {
        let key = make_storage_key("lock:", "resource:1", 512, 0);
        assert_eq!(key, "lock:resource:1");
    }

    #[test]
    fn make_storage_key_truncates_deterministically_when_too_long() {
        let long_key = "x".repeat(2000);
        let key = make_storage_key("lock:", &long_key, 512, 26);
        assert!(key.len() <= 512 - 26);
        assert!(key.starts_with("lock:"));
    }

    #[test]
    fn make_storage_key_differs_for_inputs_differing_before_cut() {
        let limit = 64;
        let a = "y".repeat(200) + "AAAA";
        let b = "y".repeat(200) + "BBBB";
        let ka = make_storage_key("p:", &a, limit, 0);
        let kb = make_storage_key("p:", &b, limit, 0);
        assert_ne!(ka, kb);
    }

    #[test]
    fn make_storage_key_same_for_nfc_equivalent_inputs() {
        let a = normalize_and_validate_key("café").unwrap();
        let b = normalize_and_validate_key("cafe\u{0301}").unwrap();
        let long_a = a.repeat(100);
        let long_b = b.repeat(100);
        let ka = make_storage_key("p:", &long_a, 64, 0);
        let kb = make_storage_key("p:", &long_b, 64, 0);
        assert_eq!(ka, kb);
    }
}
