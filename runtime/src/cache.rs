//! Versioned read-through cache coordinator.
//!
//! Derived results for unbounded key spaces (listings, search results) are
//! grouped into a [`CacheFamily`]. Every entry key embeds the family's
//! current version:
//!
//! ```text
//! content-list:version        = 4
//! content-list:v3:1:10   (unreachable, ages out by TTL)
//! content-list:v4:1:10   (live)
//! ```
//!
//! A write bumps the version with one atomic increment and never deletes
//! entries, so invalidating a whole family costs O(1) and needs no key scan.
//!
//! Single items (bounded key space) are cached under direct keys and
//! invalidated by deleting the key instead.
//!
//! The cache store is an optimisation, never a dependency: every store call
//! runs under a timeout, reads that fail are treated as misses, and writes
//! that fail are logged and dropped.

use crate::metrics::CacheMetrics;
use ripple_core::cache::{CacheError, CacheFuture, CacheStore};
use ripple_core::keys::{self, CacheFamily, ItemResource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Version assumed for a family that has never been bumped.
pub const INITIAL_VERSION: u64 = 1;

/// Default timeout for a single cache store call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

/// Result of a versioned lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    /// Cached value on a hit.
    pub value: Option<String>,
    /// Version the lookup resolved, `None` if the store was unreachable.
    pub version: Option<u64>,
}

impl CacheLookup {
    /// True if a value was found.
    #[must_use]
    pub const fn hit(&self) -> bool {
        self.value.is_some()
    }

    const fn unavailable() -> Self {
        Self {
            value: None,
            version: None,
        }
    }
}

/// Versioned cache over a shared [`CacheStore`].
#[derive(Clone)]
pub struct VersionedCache {
    store: Arc<dyn CacheStore>,
    op_timeout: Duration,
}

impl VersionedCache {
    /// Coordinator with the default operation timeout.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_timeout(store, DEFAULT_OPERATION_TIMEOUT)
    }

    /// Coordinator with a custom operation timeout.
    #[must_use]
    pub fn with_timeout(store: Arc<dyn CacheStore>, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    async fn guarded<T>(&self, operation: CacheFuture<'_, T>) -> Result<T, CacheError> {
        tokio::time::timeout(self.op_timeout, operation)
            .await
            .map_err(|_| CacheError::Timeout(self.op_timeout))?
    }

    /// Current version of `family`; [`INITIAL_VERSION`] if never bumped.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the store fails, times out or holds a
    /// non-numeric version.
    pub async fn current_version(&self, family: &CacheFamily) -> Result<u64, CacheError> {
        let key = keys::version_key(family);
        match self.guarded(self.store.get(&key)).await? {
            None => Ok(INITIAL_VERSION),
            Some(raw) => raw
                .parse()
                .map_err(|_| CacheError::Command(format!("version key '{key}' holds '{raw}'"))),
        }
    }

    /// Advance the family version, making every existing entry unreachable.
    ///
    /// Returns the new version. Atomic: concurrent callers never see the
    /// same value. Existing entries are left to expire.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the increment fails. The caller decides
    /// whether to log or propagate.
    pub async fn bump_version(&self, family: &CacheFamily) -> Result<u64, CacheError> {
        let key = keys::version_key(family);
        let mut version = self.guarded(self.store.incr(&key)).await?;
        if version <= INITIAL_VERSION {
            // Counter did not exist, so readers were on the implicit initial version.
            version = self.guarded(self.store.incr(&key)).await?;
        }
        CacheMetrics::record_version_bump(family.as_str());
        tracing::debug!(family = %family, version, "Cache family version bumped");
        Ok(version)
    }

    /// Look up `discriminator` under the family's current version.
    ///
    /// Never fails: an unreachable store yields a miss.
    pub async fn get(&self, family: &CacheFamily, discriminator: &str) -> CacheLookup {
        let version = match self.current_version(family).await {
            Ok(version) => version,
            Err(error) => {
                self.fail_open(family, "resolve version", &error);
                return CacheLookup::unavailable();
            }
        };
        let value = self.get_at(family, version, discriminator).await;
        CacheLookup {
            value,
            version: Some(version),
        }
    }

    async fn get_at(&self, family: &CacheFamily, version: u64, discriminator: &str) -> Option<String> {
        let key = keys::entry_key(family, version, discriminator);
        match self.guarded(self.store.get(&key)).await {
            Ok(Some(value)) => {
                CacheMetrics::record_hit(family.as_str());
                Some(value)
            }
            Ok(None) => {
                CacheMetrics::record_miss(family.as_str());
                None
            }
            Err(error) => {
                self.fail_open(family, "get", &error);
                None
            }
        }
    }

    /// Store `value` under the family's current version.
    ///
    /// Failures are logged and swallowed.
    pub async fn put(&self, family: &CacheFamily, discriminator: &str, value: &str, ttl: Duration) {
        match self.current_version(family).await {
            Ok(version) => self.put_at(family, version, discriminator, value, ttl).await,
            Err(error) => self.fail_open(family, "resolve version", &error),
        }
    }

    /// Store `value` under an explicit version, normally the one a preceding
    /// [`VersionedCache::get`] resolved. A bump in between leaves the entry
    /// unreachable instead of publishing stale data under the new version.
    pub async fn put_at(
        &self,
        family: &CacheFamily,
        version: u64,
        discriminator: &str,
        value: &str,
        ttl: Duration,
    ) {
        let key = keys::entry_key(family, version, discriminator);
        if let Err(error) = self.guarded(self.store.set_ex(&key, value, ttl)).await {
            self.fail_open(family, "put", &error);
        }
    }

    /// Typed [`VersionedCache::get`]. Undecodable entries count as misses.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        family: &CacheFamily,
        discriminator: &str,
    ) -> (Option<T>, Option<u64>) {
        let lookup = self.get(family, discriminator).await;
        let value = lookup.value.and_then(|raw| decode(family.as_str(), &raw));
        (value, lookup.version)
    }

    /// Typed [`VersionedCache::put`].
    pub async fn put_json<T: Serialize>(
        &self,
        family: &CacheFamily,
        discriminator: &str,
        value: &T,
        ttl: Duration,
    ) {
        if let Some(raw) = encode(family.as_str(), value) {
            self.put(family, discriminator, &raw, ttl).await;
        }
    }

    /// Read-through: serve from cache, or run `load` and cache its result
    /// under the version observed before loading.
    ///
    /// # Errors
    ///
    /// Returns whatever `load` returns; cache failures never surface.
    pub async fn get_or_load<T, E, F, Fut>(
        &self,
        family: &CacheFamily,
        discriminator: &str,
        ttl: Duration,
        load: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (cached, version) = self.get_json::<T>(family, discriminator).await;
        if let Some(value) = cached {
            return Ok(value);
        }

        let value = load().await?;
        if let (Some(version), Some(raw)) = (version, encode(family.as_str(), &value)) {
            self.put_at(family, version, discriminator, &raw, ttl).await;
        }
        Ok(value)
    }

    /// Look up a single item by direct key. Never fails.
    pub async fn get_item(&self, resource: &ItemResource, id: &str) -> Option<String> {
        let key = keys::item_key(resource, id);
        match self.guarded(self.store.get(&key)).await {
            Ok(Some(value)) => {
                CacheMetrics::record_hit(resource.as_str());
                Some(value)
            }
            Ok(None) => {
                CacheMetrics::record_miss(resource.as_str());
                None
            }
            Err(error) => {
                self.fail_open_item(resource, "get", &error);
                None
            }
        }
    }

    /// Cache a single item. Failures are logged and swallowed.
    pub async fn put_item(&self, resource: &ItemResource, id: &str, value: &str, ttl: Duration) {
        let key = keys::item_key(resource, id);
        if let Err(error) = self.guarded(self.store.set_ex(&key, value, ttl)).await {
            self.fail_open_item(resource, "put", &error);
        }
    }

    /// Delete a single item's key. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the delete fails.
    pub async fn invalidate_item(&self, resource: &ItemResource, id: &str) -> Result<bool, CacheError> {
        let key = keys::item_key(resource, id);
        self.guarded(self.store.delete(&key)).await
    }

    /// Read-through for a single item.
    ///
    /// # Errors
    ///
    /// Returns whatever `load` returns; cache failures never surface.
    pub async fn get_item_or_load<T, E, F, Fut>(
        &self,
        resource: &ItemResource,
        id: &str,
        ttl: Duration,
        load: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get_item_or_load_confirmed(resource, id, ttl, load, || async { true })
            .await
    }

    /// Read-through for a single item that may be deleted concurrently.
    ///
    /// After a loaded value is cached, `still_exists` asks the source again.
    /// If the item is gone the key is deleted, so an entry written after the
    /// deleter's invalidation cannot outlive the item.
    ///
    /// # Errors
    ///
    /// Returns whatever `load` returns; cache failures never surface.
    pub async fn get_item_or_load_confirmed<T, E, F, Fut, C, CFut>(
        &self,
        resource: &ItemResource,
        id: &str,
        ttl: Duration,
        load: F,
        still_exists: C,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce() -> CFut,
        CFut: Future<Output = bool>,
    {
        if let Some(value) = self
            .get_item(resource, id)
            .await
            .and_then(|raw| decode(resource.as_str(), &raw))
        {
            return Ok(value);
        }

        let value = load().await?;
        let Some(raw) = encode(resource.as_str(), &value) else {
            return Ok(value);
        };
        self.put_item(resource, id, &raw, ttl).await;

        if !still_exists().await {
            tracing::debug!(resource = %resource, id, "Item deleted while loading, dropping cached copy");
            if let Err(error) = self.invalidate_item(resource, id).await {
                self.fail_open_item(resource, "invalidate", &error);
            }
        }
        Ok(value)
    }

    fn fail_open(&self, family: &CacheFamily, operation: &str, error: &CacheError) {
        CacheMetrics::record_fail_open(family.as_str());
        tracing::warn!(
            family = %family,
            operation,
            timeout_ms = u64::try_from(self.op_timeout.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Cache unavailable, continuing without it"
        );
    }

    fn fail_open_item(&self, resource: &ItemResource, operation: &str, error: &CacheError) {
        CacheMetrics::record_fail_open(resource.as_str());
        tracing::warn!(
            resource = %resource,
            operation,
            timeout_ms = u64::try_from(self.op_timeout.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Item cache unavailable, continuing without it"
        );
    }
}

fn decode<T: DeserializeOwned>(label: &str, raw: &str) -> Option<T> {
    serde_json::from_str(raw)
        .map_err(|error| tracing::warn!(cache = label, error = %error, "Discarding undecodable cache entry"))
        .ok()
}

fn encode<T: Serialize>(label: &str, value: &T) -> Option<String> {
    serde_json::to_string(value)
        .map_err(|error| tracing::warn!(cache = label, error = %error, "Value not cacheable"))
        .ok()
}
