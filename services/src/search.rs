//! Search service: a read model derived from `content.*` events.
//!
//! [`SearchIndexer`] keeps one [`SearchRecord`] per content id. Creation is
//! an upsert and deletion is delete-if-exists, so redelivered events leave
//! the index unchanged. After each mutation the `search` family version is
//! bumped, dropping every cached result at once.

use crate::config::CacheTtls;
use async_trait::async_trait;
use ripple_core::event::{DomainEvent, EventKind};
use ripple_core::handler::{EventHandler, HandlerError};
use ripple_core::keys::CacheFamily;
use ripple_core::store::{SearchIndex, SearchRecord, StoreError};
use ripple_runtime::VersionedCache;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Versioned family holding search results.
pub const SEARCH_RESULTS: CacheFamily = CacheFamily::from_static("search");

/// Most results returned for one query.
pub const MAX_RESULTS: usize = 10;

/// Errors returned by [`SearchService::search`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// The query is empty after trimming.
    #[error("Query is required")]
    EmptyQuery,

    /// The index failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Applies content events to the search index.
pub struct SearchIndexer<I> {
    index: Arc<I>,
    cache: VersionedCache,
}

impl<I: SearchIndex> SearchIndexer<I> {
    /// Indexer writing to `index`.
    #[must_use]
    pub const fn new(index: Arc<I>, cache: VersionedCache) -> Self {
        Self { index, cache }
    }

    async fn invalidate(&self, content_id: &str) {
        if let Err(error) = self.cache.bump_version(&SEARCH_RESULTS).await {
            tracing::warn!(
                content_id,
                error = %error,
                "Failed to bump search cache version; results stay cached until TTL"
            );
        }
    }
}

#[async_trait]
impl<I: SearchIndex + 'static> EventHandler for SearchIndexer<I> {
    fn name(&self) -> &str {
        "search-indexer"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        match event.kind() {
            EventKind::ContentCreated => {
                let body = event.text().ok_or_else(|| {
                    HandlerError::Permanent("content.created carries no content".to_string())
                })?;
                self.index
                    .upsert(SearchRecord {
                        content_id: event.content_id().to_string(),
                        actor_id: event.actor_id().to_string(),
                        body: body.to_string(),
                        created_at: event.occurred_at(),
                    })
                    .await?;
                tracing::info!(content_id = event.content_id(), "Search record upserted");
                self.invalidate(event.content_id()).await;
            }
            EventKind::ContentDeleted => {
                if self.index.delete_by_content_id(event.content_id()).await? {
                    tracing::info!(content_id = event.content_id(), "Search record deleted");
                    self.invalidate(event.content_id()).await;
                } else {
                    tracing::debug!(content_id = event.content_id(), "No search record to delete");
                }
            }
        }
        Ok(())
    }
}

/// Cached full-text queries over the index.
pub struct SearchService<I> {
    index: Arc<I>,
    cache: VersionedCache,
    ttl: Duration,
}

impl<I: SearchIndex> SearchService<I> {
    /// Service reading `index`.
    #[must_use]
    pub const fn new(index: Arc<I>, cache: VersionedCache, ttls: &CacheTtls) -> Self {
        Self {
            index,
            cache,
            ttl: ttls.search,
        }
    }

    /// Matching records, newest first, at most [`MAX_RESULTS`].
    ///
    /// Results are cached per lower-cased, trimmed query under the current
    /// `search` version.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::EmptyQuery`] for a blank query and
    /// [`SearchError::Store`] on a miss the index cannot serve.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchRecord>, SearchError> {
        let normalized = query.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(SearchError::EmptyQuery);
        }

        self.cache
            .get_or_load(&SEARCH_RESULTS, &normalized, self.ttl, || async {
                let hits = self.index.search(&normalized, MAX_RESULTS).await?;
                Ok::<_, SearchError>(hits)
            })
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ripple_core::handler::{Disposition, dispatch};
    use ripple_testing::{InMemoryCacheStore, InMemorySearchIndex, test_clock};

    fn setup() -> (SearchIndexer<InMemorySearchIndex>, SearchService<InMemorySearchIndex>, Arc<InMemorySearchIndex>, InMemoryCacheStore) {
        let index = Arc::new(InMemorySearchIndex::new());
        let store = InMemoryCacheStore::new();
        let cache = VersionedCache::new(Arc::new(store.clone()));
        (
            SearchIndexer::new(Arc::clone(&index), cache.clone()),
            SearchService::new(Arc::clone(&index), cache, &CacheTtls::default()),
            index,
            store,
        )
    }

    fn created(id: &str, body: &str) -> DomainEvent {
        DomainEvent::content_created(id, "u1", body, &[], test_clock().now_fixed())
    }

    #[tokio::test]
    async fn created_twice_leaves_one_record() {
        let (indexer, _, index, _) = setup();
        indexer.handle(&created("p1", "Hello")).await.unwrap();
        indexer.handle(&created("p1", "Hello")).await.unwrap();

        assert_eq!(index.count_for("p1"), 1);
        assert_eq!(index.get("p1").unwrap().body, "Hello");
    }

    #[tokio::test]
    async fn delete_of_missing_record_is_a_no_op() {
        let (indexer, _, index, cache) = setup();
        let deleted = DomainEvent::content_deleted("p9", "u1", &[], test_clock().now_fixed());

        indexer.handle(&deleted).await.unwrap();
        indexer.handle(&deleted).await.unwrap();
        assert!(index.is_empty());
        // Nothing changed, so cached results stay valid.
        assert!(cache.peek("search:version").is_none());
    }

    #[tokio::test]
    async fn index_outage_is_transient() {
        let (indexer, _, index, _) = setup();
        index.fail_next(1);

        let bytes = created("p1", "Hello").encode().unwrap();
        let disposition = dispatch(&indexer, "content.created", &bytes).await;
        assert!(matches!(disposition, Disposition::Retry(_)));
        assert_eq!(dispatch(&indexer, "content.created", &bytes).await, Disposition::Handled);
        assert_eq!(index.count_for("p1"), 1);
    }

    #[tokio::test]
    async fn created_without_content_is_permanent() {
        let (indexer, _, _, _) = setup();
        let event = DomainEvent::new(
            EventKind::ContentCreated,
            "p1",
            "u1",
            serde_json::Map::new(),
            test_clock().now_fixed(),
        );
        assert!(matches!(
            indexer.handle(&event).await,
            Err(HandlerError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn queries_are_normalized_and_cached_until_the_index_changes() {
        let (indexer, service, _, cache) = setup();
        indexer.handle(&created("p1", "Rust in production")).await.unwrap();
        let version = cache.peek("search:version").unwrap();

        let hits = service.search("  RUST ").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(cache.peek(&format!("search:v{version}:rust")).is_some());

        indexer.handle(&created("p2", "rusty nails")).await.unwrap();
        assert_eq!(service.search("rust").await.unwrap().len(), 2);

        indexer
            .handle(&DomainEvent::content_deleted("p1", "u1", &[], test_clock().now_fixed()))
            .await
            .unwrap();
        let hits = service.search("Rust").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content_id, "p2");
    }

    #[tokio::test]
    async fn blank_query_is_rejected() {
        let (_, service, _, _) = setup();
        assert_eq!(service.search("   ").await, Err(SearchError::EmptyQuery));
    }
}
