//! Content service: the authoritative owner of content and the only
//! producer of `content.*` events.
//!
//! Every write commits to the [`ContentStore`] first. Only then is the event
//! emitted and are local caches invalidated (`content-list` bumped,
//! `content:<id>` deleted). A failed publish is logged by the producer and
//! never fails the write.

use crate::config::CacheTtls;
use ripple_core::environment::Clock;
use ripple_core::event::DomainEvent;
use ripple_core::keys::{CacheFamily, ItemResource};
use ripple_core::store::{ContentRecord, ContentStore, NewContent, Page, StoreError};
use ripple_runtime::{
    DomainEventProducer, Invalidation, RateAdmissionController, RateLimitPolicy, VersionedCache,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Versioned family holding listing pages.
pub const CONTENT_LIST: CacheFamily = CacheFamily::from_static("content-list");

/// Direct-key resource for single content items.
pub const CONTENT_ITEM: ItemResource = ItemResource::from_static("content");

/// Longest accepted body, in characters.
pub const MAX_BODY_CHARS: usize = 5000;

/// Most media ids one piece of content may reference.
pub const MAX_MEDIA_IDS: usize = 10;

/// Largest page size a listing may request.
pub const MAX_PAGE_LIMIT: u32 = 50;

/// Page used when none is given.
pub const DEFAULT_PAGE: u32 = 1;

/// Page size used when none is given.
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

/// Content service errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    /// Request failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No authenticated actor.
    #[error("Unauthorized")]
    Unauthorized,

    /// The actor used up their creation quota.
    #[error("Too many requests")]
    RateLimited,

    /// Content does not exist or is not owned by the actor.
    #[error("Content not found: {0}")]
    NotFound(String),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One listing page as served to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentListing {
    /// Newest first.
    pub items: Vec<ContentRecord>,
    /// 1-based page number.
    pub current_page: u32,
    /// Pages available at this page size.
    pub total_pages: u64,
    /// Items across all pages.
    pub total_items: u64,
}

impl From<Page<ContentRecord>> for ContentListing {
    fn from(page: Page<ContentRecord>) -> Self {
        Self {
            total_pages: page.total.div_ceil(u64::from(page.limit.max(1))),
            current_page: page.page,
            total_items: page.total,
            items: page.items,
        }
    }
}

/// Content creation, deletion and cached reads.
pub struct ContentService<S> {
    store: S,
    cache: VersionedCache,
    limiter: RateAdmissionController,
    producer: DomainEventProducer,
    clock: Arc<dyn Clock>,
    ttls: CacheTtls,
}

impl<S: ContentStore> ContentService<S> {
    /// Wire the service.
    ///
    /// `producer` should invalidate [`CONTENT_LIST`] and [`CONTENT_ITEM`];
    /// [`ContentService::invalidation`] builds exactly that.
    #[must_use]
    pub fn new(
        store: S,
        cache: VersionedCache,
        limiter: RateAdmissionController,
        producer: DomainEventProducer,
        clock: Arc<dyn Clock>,
        ttls: CacheTtls,
    ) -> Self {
        Self {
            store,
            cache,
            limiter,
            producer,
            clock,
            ttls,
        }
    }

    /// Caches a content write makes stale.
    #[must_use]
    pub fn invalidation() -> Invalidation {
        Invalidation::none().family(CONTENT_LIST).item(CONTENT_ITEM)
    }

    /// The authoritative store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Create content for `actor`.
    ///
    /// # Errors
    ///
    /// - [`ContentError::Unauthorized`] for a blank actor
    /// - [`ContentError::RateLimited`] once the creation quota is used up
    /// - [`ContentError::Validation`] for an empty or oversized body or too many media ids
    /// - [`ContentError::Store`] if the commit fails; nothing is emitted then
    pub async fn create(
        &self,
        actor: &str,
        body: &str,
        media_ids: Vec<String>,
    ) -> Result<ContentRecord, ContentError> {
        require_actor(actor)?;
        if !self
            .limiter
            .try_consume(&RateLimitPolicy::CONTENT_CREATION, actor, 1)
            .await
        {
            return Err(ContentError::RateLimited);
        }
        validate(body, &media_ids)?;

        let record = self
            .store
            .create(NewContent {
                author_id: actor.to_string(),
                body: body.to_string(),
                media_ids,
            })
            .await?;

        let event = DomainEvent::content_created(
            record.id.as_str(),
            record.author_id.as_str(),
            record.body.as_str(),
            &record.media_ids,
            record.created_at,
        );
        let report = self.producer.emit_event(&event).await;
        tracing::info!(
            content_id = %record.id,
            actor,
            published = report.published,
            "Content created"
        );
        Ok(record)
    }

    /// Delete content `id` if `actor` owns it.
    ///
    /// The emitted `content.deleted` carries the media ids the content
    /// referenced, so the media service can clean them up.
    ///
    /// # Errors
    ///
    /// - [`ContentError::Unauthorized`] for a blank actor
    /// - [`ContentError::NotFound`] if the content is missing or owned by someone else
    /// - [`ContentError::Store`] if the delete fails
    pub async fn delete(&self, actor: &str, id: &str) -> Result<ContentRecord, ContentError> {
        require_actor(actor)?;
        let record = self
            .store
            .delete_owned(id, actor)
            .await?
            .ok_or_else(|| ContentError::NotFound(id.to_string()))?;

        let event = DomainEvent::content_deleted(
            record.id.as_str(),
            actor,
            &record.media_ids,
            self.clock.now(),
        );
        let report = self.producer.emit_event(&event).await;
        tracing::info!(
            content_id = %record.id,
            actor,
            media = record.media_ids.len(),
            published = report.published,
            "Content deleted"
        );
        Ok(record)
    }

    /// Newest-first listing, read through the versioned `content-list` cache.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Validation`] for a page below 1 or a limit
    /// outside `1..=50`, and [`ContentError::Store`] on a miss the store
    /// cannot serve.
    pub async fn list(&self, page: Option<u32>, limit: Option<u32>) -> Result<ContentListing, ContentError> {
        let page = page.unwrap_or(DEFAULT_PAGE);
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if page < 1 {
            return Err(ContentError::Validation("page must be at least 1".to_string()));
        }
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(ContentError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }

        self.cache
            .get_or_load(&CONTENT_LIST, &format!("{page}:{limit}"), self.ttls.list, || async {
                let page = self.store.list(page, limit).await?;
                Ok::<_, ContentError>(ContentListing::from(page))
            })
            .await
    }

    /// Single item, read through its direct key. Misses are not cached.
    ///
    /// A freshly cached item is checked against the store once more, so a
    /// delete racing this read cannot leave the item cached.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::NotFound`] if no such content exists and
    /// [`ContentError::Store`] if the store fails.
    pub async fn get(&self, id: &str) -> Result<ContentRecord, ContentError> {
        self.cache
            .get_item_or_load_confirmed(
                &CONTENT_ITEM,
                id,
                self.ttls.item,
                || async {
                    self.store
                        .find_by_id(id)
                        .await?
                        .ok_or_else(|| ContentError::NotFound(id.to_string()))
                },
                || async { matches!(self.store.find_by_id(id).await, Ok(Some(_))) },
            )
            .await
    }
}

fn require_actor(actor: &str) -> Result<(), ContentError> {
    if actor.trim().is_empty() {
        Err(ContentError::Unauthorized)
    } else {
        Ok(())
    }
}

fn validate(body: &str, media_ids: &[String]) -> Result<(), ContentError> {
    if body.trim().is_empty() {
        return Err(ContentError::Validation("content must not be empty".to_string()));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(ContentError::Validation(format!(
            "content must be at most {MAX_BODY_CHARS} characters"
        )));
    }
    if media_ids.len() > MAX_MEDIA_IDS {
        return Err(ContentError::Validation(format!(
            "at most {MAX_MEDIA_IDS} media ids are allowed"
        )));
    }
    if media_ids.iter().any(|id| id.trim().is_empty()) {
        return Err(ContentError::Validation("media ids must not be blank".to_string()));
    }
    Ok(())
}
