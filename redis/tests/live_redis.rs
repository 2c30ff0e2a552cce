//! [`RedisCacheStore`] against a running Redis.
//!
//! Run with: `docker run -d -p 6379:6379 redis:7-alpine`, then
//! `cargo test -p ripple-redis -- --ignored`.

#![allow(clippy::unwrap_used)]

use ripple_core::cache::CacheStore;
use ripple_core::keys::{CacheFamily, RateScope};
use ripple_redis::RedisCacheStore;
use ripple_runtime::{FailMode, RateAdmissionController, RateLimitPolicy, VersionedCache};
use std::sync::Arc;
use std::time::Duration;

const URL: &str = "redis://127.0.0.1:6379";

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn values_expire_and_deletes_report_existence() {
    let store = RedisCacheStore::connect(URL).await.unwrap();
    let key = unique("it-item");

    store.set_ex(&key, "v", Duration::from_millis(300)).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("v"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.get(&key).await.unwrap(), None);

    store.set_ex(&key, "v", Duration::from_secs(10)).await.unwrap();
    assert!(store.delete(&key).await.unwrap());
    assert!(!store.delete(&key).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn concurrent_version_bumps_are_distinct() {
    let store: Arc<dyn CacheStore> = Arc::new(RedisCacheStore::connect(URL).await.unwrap());
    let cache = VersionedCache::new(store);
    let family = CacheFamily::parse(&unique("it-family")).unwrap();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let cache = cache.clone();
            let family = family.clone();
            tokio::spawn(async move { cache.bump_version(&family).await.unwrap() })
        })
        .collect();

    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.unwrap());
    }
    versions.sort_unstable();
    versions.dedup();
    assert_eq!(versions.len(), 20);
    assert!(versions[0] >= 2);
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn fixed_window_admits_exactly_the_quota() {
    let store: Arc<dyn CacheStore> = Arc::new(RedisCacheStore::connect(URL).await.unwrap());
    let limiter = RateAdmissionController::new(store);
    let policy = RateLimitPolicy::new(
        RateScope::parse(&unique("it-scope")).unwrap(),
        3,
        Duration::from_secs(1),
        FailMode::Closed,
    );

    for _ in 0..3 {
        assert!(limiter.try_consume(&policy, "actor", 1).await);
    }
    let denied = limiter.check(&policy, "actor", 1).await;
    assert!(!denied.allowed);
    assert!(denied.reset_after <= Duration::from_secs(1));

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(limiter.try_consume(&policy, "actor", 1).await);
}
