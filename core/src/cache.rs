//! Shared cache store primitives.
//!
//! The cache store is a remote key/value service reachable by every instance
//! of a service. Entries are strings with an optional TTL. Counters are
//! updated atomically by the store itself so concurrent writers never lose an
//! increment.
//!
//! Higher-level policies (versioned read-through caching, rate admission)
//! live in `ripple-runtime` and only talk to this trait.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when talking to the cache store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Could not reach the store
    #[error("Cache connection error: {0}")]
    Connection(String),

    /// The store did not answer in time
    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store rejected a command
    #[error("Cache command failed: {0}")]
    Command(String),
}

/// Result of an increment on a fixed-window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after the increment.
    pub count: u64,
    /// Time until the counter expires and the window starts over.
    pub reset_after: Duration,
}

/// Boxed future returned by [`CacheStore`] operations.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Remote key/value store with TTLs and atomic counters.
///
/// # Dyn Compatibility
///
/// Returns boxed futures so stores can be shared as `Arc<dyn CacheStore>`.
pub trait CacheStore: Send + Sync {
    /// Read a value. `None` if absent or expired.
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;

    /// Write a value that expires after `ttl`.
    fn set_ex<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> CacheFuture<'a, ()>;

    /// Remove a key. Returns whether it existed.
    fn delete<'a>(&'a self, key: &'a str) -> CacheFuture<'a, bool>;

    /// Atomically add one to a counter with no expiry, returning the new value.
    /// A missing key counts from zero.
    fn incr<'a>(&'a self, key: &'a str) -> CacheFuture<'a, u64>;

    /// Atomically add `by` to a fixed-window counter.
    ///
    /// The first increment in a window starts the window: the key expires
    /// `window` later. Later increments in the same window leave the expiry
    /// alone.
    fn incr_window<'a>(&'a self, key: &'a str, by: u64, window: Duration) -> CacheFuture<'a, WindowCount>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_with_context() {
        assert_eq!(
            CacheError::Timeout(Duration::from_millis(250)).to_string(),
            "Cache operation timed out after 250ms"
        );
        assert!(CacheError::Connection("refused".into()).to_string().contains("refused"));
    }
}
