//! In-memory cache store.
//!
//! Mirrors the Redis semantics the runtime relies on: string values, TTL
//! expiry, counters stored as decimal strings and fixed-window increments
//! that set the expiry only when the window opens. Time comes from a
//! [`ManualClock`] so expiry is deterministic.

#![allow(clippy::unwrap_used)] // Lock poisoning only follows an earlier panic
#![allow(clippy::missing_panics_doc)]

use crate::mocks::{ManualClock, test_clock};
use chrono::{DateTime, Utc};
use ripple_core::cache::{CacheError, CacheFuture, CacheStore, WindowCount};
use ripple_core::environment::Clock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// HashMap-backed [`CacheStore`] with fault injection.
#[derive(Clone)]
pub struct InMemoryCacheStore {
    data: Arc<RwLock<HashMap<String, Entry>>>,
    clock: ManualClock,
    fail_next: Arc<AtomicU32>,
    unavailable: Arc<AtomicBool>,
    latency: Arc<RwLock<Option<Duration>>>,
}

impl InMemoryCacheStore {
    /// Store with its own clock starting at the test epoch.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(ManualClock::new(test_clock().now_fixed()))
    }

    /// Store reading time from `clock`.
    #[must_use]
    pub fn with_clock(clock: ManualClock) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            clock,
            fail_next: Arc::new(AtomicU32::new(0)),
            unavailable: Arc::new(AtomicBool::new(false)),
            latency: Arc::new(RwLock::new(None)),
        }
    }

    /// The clock driving expiry.
    #[must_use]
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Fail the next `count` operations with a connection error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Simulate a full outage until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every operation, for exercising client-side timeouts.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().unwrap() = latency;
    }

    /// Raw value of a live key, bypassing fault injection.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        self.data
            .read()
            .unwrap()
            .get(key)
            .filter(|entry| is_live(entry, now))
            .map(|entry| entry.value.clone())
    }

    /// Remaining time to live of a key, `None` if absent or persistent.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let data = self.data.read().unwrap();
        let entry = data.get(key).filter(|entry| is_live(entry, now))?;
        remaining(entry.expires_at?, now)
    }

    /// Live keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .data
            .read()
            .unwrap()
            .iter()
            .filter(|(_, entry)| is_live(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Expired entries still physically present (not yet collected).
    #[must_use]
    pub fn expired_len(&self) -> usize {
        let now = self.clock.now();
        self.data
            .read()
            .unwrap()
            .values()
            .filter(|entry| !is_live(entry, now))
            .count()
    }

    async fn gate(&self) -> Result<(), CacheError> {
        let latency = *self.latency.read().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Connection("cache store unavailable".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CacheError::Connection("injected cache failure".to_string()));
        }
        Ok(())
    }

    fn counter(entry: Option<&Entry>) -> Result<u64, CacheError> {
        entry.map_or(Ok(0), |entry| {
            entry
                .value
                .parse()
                .map_err(|_| CacheError::Command("value is not an integer".to_string()))
        })
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_live(entry: &Entry, now: DateTime<Utc>) -> bool {
    entry.expires_at.is_none_or(|at| at > now)
}

fn remaining(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    (expires_at - now).to_std().ok()
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl CacheStore for InMemoryCacheStore {
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            self.gate().await?;
            Ok(self.peek(key))
        })
    }

    fn set_ex<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.gate().await?;
            let now = self.clock.now();
            self.data.write().unwrap().insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(deadline(now, ttl)),
                },
            );
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool> {
        Box::pin(async move {
            self.gate().await?;
            let now = self.clock.now();
            let removed = self.data.write().unwrap().remove(key);
            Ok(removed.is_some_and(|entry| is_live(&entry, now)))
        })
    }

    fn incr<'a>(&'a self, key: &'a str) -> CacheFuture<'a, u64> {
        Box::pin(async move {
            self.gate().await?;
            let now = self.clock.now();
            let mut data = self.data.write().unwrap();
            let live = data.get(key).filter(|entry| is_live(entry, now));
            let expires_at = live.and_then(|entry| entry.expires_at);
            let next = Self::counter(live)? + 1;
            data.insert(
                key.to_string(),
                Entry {
                    value: next.to_string(),
                    expires_at,
                },
            );
            Ok(next)
        })
    }

    fn incr_window<'a>(&'a self, key: &'a str, by: u64, window: Duration) -> CacheFuture<'a, WindowCount> {
        Box::pin(async move {
            self.gate().await?;
            let now = self.clock.now();
            let mut data = self.data.write().unwrap();
            let live = data.get(key).filter(|entry| is_live(entry, now));

            let (count, expires_at) = match live {
                Some(entry) => {
                    let count = Self::counter(Some(entry))?.saturating_add(by);
                    let expires_at = entry.expires_at.unwrap_or_else(|| deadline(now, window));
                    (count, expires_at)
                }
                None => (by, deadline(now, window)),
            };

            data.insert(
                key.to_string(),
                Entry {
                    value: count.to_string(),
                    expires_at: Some(expires_at),
                },
            );
            Ok(WindowCount {
                count,
                reset_after: remaining(expires_at, now).unwrap_or_default(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire_with_the_clock() {
        let cache = InMemoryCacheStore::new();
        cache.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.ttl("k"), Some(Duration::from_secs(10)));

        cache.clock().advance(Duration::from_secs(10));
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.expired_len(), 1);
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn incr_counts_from_zero_without_expiry() {
        let cache = InMemoryCacheStore::new();
        assert_eq!(cache.incr("content-list:version").await.unwrap(), 1);
        assert_eq!(cache.incr("content-list:version").await.unwrap(), 2);
        assert_eq!(cache.ttl("content-list:version"), None);

        cache.set_ex("text", "abc", Duration::from_secs(5)).await.unwrap();
        assert!(matches!(cache.incr("text").await, Err(CacheError::Command(_))));
    }

    #[tokio::test]
    async fn window_expiry_is_fixed_at_first_increment() {
        let cache = InMemoryCacheStore::new();
        let window = Duration::from_secs(60);

        let first = cache.incr_window("rl:x:u1", 1, window).await.unwrap();
        assert_eq!(first, WindowCount { count: 1, reset_after: window });

        cache.clock().advance(Duration::from_secs(45));
        let second = cache.incr_window("rl:x:u1", 2, window).await.unwrap();
        assert_eq!(second.count, 3);
        assert_eq!(second.reset_after, Duration::from_secs(15));

        cache.clock().advance(Duration::from_secs(15));
        let fresh = cache.incr_window("rl:x:u1", 1, window).await.unwrap();
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.reset_after, window);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_connection_errors() {
        let cache = InMemoryCacheStore::new();
        cache.fail_next(1);
        assert!(matches!(cache.get("k").await, Err(CacheError::Connection(_))));
        assert!(cache.get("k").await.is_ok());

        cache.set_unavailable(true);
        assert!(cache.incr("k").await.is_err());
        cache.set_unavailable(false);
        assert_eq!(cache.incr("k").await.unwrap(), 1);
    }
}
