//! # Ripple Testing
//!
//! In-memory stand-ins for everything the consistency layer talks to, so
//! services and the runtime can be exercised end to end without a broker,
//! a Redis server or a database.
//!
//! This crate provides:
//! - [`InMemoryEventBus`]: topic exchange with fan-out, explicit ack/requeue
//!   and publish fault injection
//! - [`InMemoryCacheStore`]: TTL-aware key/value store driven by a
//!   [`ManualClock`], with outage and latency injection
//! - In-memory content, search, media and object stores
//!
//! ## Example
//!
//! ```
//! use ripple_core::cache::CacheStore;
//! use ripple_testing::{InMemoryCacheStore, ManualClock, test_clock};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let clock = ManualClock::new(test_clock().now_fixed());
//! let cache = InMemoryCacheStore::with_clock(clock.clone());
//!
//! cache.set_ex("content:p1", "{}", Duration::from_secs(60)).await.unwrap();
//! clock.advance(Duration::from_secs(61));
//! assert_eq!(cache.get("content:p1").await.unwrap(), None);
//! # });
//! ```

use chrono::{DateTime, Utc};
use ripple_core::environment::Clock;

pub mod cache_store;
pub mod event_bus;
pub mod stores;

/// Deterministic clocks.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }

        /// The fixed instant.
        #[must_use]
        pub const fn now_fixed(&self) -> DateTime<Utc> {
            self.time
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hold one handle and give
    /// another to the component under test.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move time forward.
        ///
        /// # Panics
        ///
        /// Panics if the lock is poisoned or `by` overflows the calendar.
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.write().unwrap();
            *time += chrono::Duration::from_std(by).unwrap();
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use cache_store::InMemoryCacheStore;
pub use event_bus::{InMemoryEventBus, PublishedMessage};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use stores::{
    InMemoryContentStore, InMemoryMediaStore, InMemoryObjectStorage, InMemorySearchIndex,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(test_clock().now());
        let handle = clock.clone();
        handle.advance(Duration::from_secs(90));
        assert_eq!((clock.now() - test_clock().now()).num_seconds(), 90);
    }
}
