//! Invariant 1: for any key, among any set of concurrent acquires at
//! most one succeeds.

mod support;

use std::sync::Arc;

use lockguard::LockBackend;
use support::MockLockBackend;

#[tokio::test]
async fn only_one_of_many_concurrent_acquires_on_the_same_key_succeeds() {
    let backend = Arc::new(MockLockBackend::new());
    const CONTENDERS: usize = 32;

    let handles: Vec<_> = (0..CONTENDERS)
        .map(|_| {
            let backend = backend.clone();
            tokio::spawn(async move { backend.acquire("contended-resource", 30_000, None).await.unwrap() })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    let successes = results.into_iter().filter(|r| r.as_ref().unwrap().ok).count();

    assert_eq!(successes, 1);
}
