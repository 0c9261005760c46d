//! Property-based tests for the invariants in spec §8 that don't reduce
//! to a single example: fence monotonicity across arbitrary acquire/
//! release schedules, key-collision behavior of `makeStorageKey`, and
//! the shape of generated fences and lockIds.

mod support;

use proptest::prelude::*;

use lockguard::key::{generate_lock_id, make_storage_key, normalize_and_validate_key};
use lockguard::{LockBackend, LookupBy};
use support::MockLockBackend;

// ─── Property: fence monotonicity across an arbitrary acquire/release schedule

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever sequence of acquire/release calls on one key runs, each
    /// successful acquire's fence is strictly greater than the last.
    #[test]
    fn fence_strictly_increases_across_schedule(releases in prop::collection::vec(any::<bool>(), 0..16)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let fences: Vec<u64> = rt.block_on(async {
            let backend = MockLockBackend::new();
            let mut fences = Vec::new();
            let mut held: Option<String> = None;

            for should_release in releases {
                if let Some(lock_id) = held.take() {
                    if should_release {
                        let _ = backend.release(&lock_id, None).await.unwrap();
                    } else {
                        held = Some(lock_id);
                        continue;
                    }
                }
                let result = backend.acquire("schedule-key", 30_000, None).await.unwrap();
                if result.ok {
                    fences.push(result.fence.as_deref().unwrap().parse().unwrap());
                    held = result.lock_id;
                }
            }
            fences
        });

        for pair in fences.windows(2) {
            prop_assert!(pair[1] > pair[0]);
        }
    }
}

// ─── Property: NFC-equivalent keys collide; pre-cut-point differences don't

proptest! {
    /// Two keys that are byte-identical before the truncation cut point
    /// but differ only after it still map to the same bounded storage
    /// key once both exceed the budget (the truncation point lands
    /// before the difference).
    #[test]
    fn storage_key_ignores_suffix_past_the_cut(
        shared in "[a-z]{300}",
        suffix_a in "[A-Z]{10}",
        suffix_b in "[A-Z]{10}",
    ) {
        let limit = 64;
        let a = format!("{shared}{suffix_a}");
        let b = format!("{shared}{suffix_b}");
        let ka = make_storage_key("p:", &a, limit, 0);
        let kb = make_storage_key("p:", &b, limit, 0);
        prop_assert_eq!(ka, kb);
    }

    /// Two keys differing before the cut point never collide.
    #[test]
    fn storage_key_preserves_prefix_differences(
        a_prefix in "[a-z]{300}",
        b_prefix in "[A-Z]{300}",
    ) {
        prop_assume!(a_prefix != b_prefix);
        let limit = 64;
        let ka = make_storage_key("p:", &a_prefix, limit, 0);
        let kb = make_storage_key("p:", &b_prefix, limit, 0);
        prop_assert_ne!(ka, kb);
    }
}

// ─── Property: generated identifiers always match their required shape

proptest! {
    /// Every generated lockId matches `^[A-Za-z0-9_-]{22}$`, regardless
    /// of how many are drawn.
    #[test]
    fn lock_ids_always_match_required_shape(count in 0usize..50) {
        for _ in 0..count {
            let id = generate_lock_id();
            prop_assert_eq!(id.len(), 22);
            prop_assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        }
    }

    /// Arbitrary valid-length strings normalize without panicking and
    /// round-trip through `makeStorageKey` deterministically.
    #[test]
    fn normalize_and_storage_key_never_panics(s in "\\PC{0,600}") {
        let normalized = normalize_and_validate_key(&s);
        if let Ok(key) = normalized {
            let storage_key = make_storage_key("p:", &key, 512, 0);
            prop_assert!(storage_key.len() <= 512);
        }
    }
}

// ─── Fuzz: lookup on arbitrary keys never panics ────────────────────────────

proptest! {
    #[test]
    fn lookup_on_arbitrary_key_never_panics(key in "\\PC{0,200}") {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let backend = MockLockBackend::new();
            let _ = backend.lookup(LookupBy::Key(key), None).await;
        });
    }
}
