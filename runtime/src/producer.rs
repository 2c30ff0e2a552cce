//! Domain event producer.
//!
//! Called by the owning service after its authoritative write has
//! committed. One emit does three things, in order:
//!
//! 1. publish the event on the bus
//! 2. bump the version of every cache family the write can affect
//! 3. delete the direct item key of the content the event is about
//!
//! Steps 2 and 3 run even when the publish fails: the local write is
//! already durable and local caches must reflect it. A failed publish is
//! logged and counted; the event is lost and remote read models stay stale
//! until the next event for the same content. The caller's write is never
//! failed because of it.

use crate::cache::VersionedCache;
use crate::metrics::EventBusMetrics;
use ripple_core::environment::Clock;
use ripple_core::event::{DomainEvent, EventKind};
use ripple_core::event_bus::EventBus;
use ripple_core::keys::{CacheFamily, ItemResource};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Caches the producing service invalidates on every emit.
#[derive(Debug, Clone, Default)]
pub struct Invalidation {
    /// Families whose version is bumped.
    pub families: Vec<CacheFamily>,
    /// Resource whose `<resource>:<contentId>` key is deleted.
    pub item: Option<ItemResource>,
}

impl Invalidation {
    /// Nothing to invalidate.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            families: Vec::new(),
            item: None,
        }
    }

    /// Add a family to bump.
    #[must_use]
    pub fn family(mut self, family: CacheFamily) -> Self {
        self.families.push(family);
        self
    }

    /// Delete the item key for the event's content id.
    #[must_use]
    pub fn item(mut self, resource: ItemResource) -> Self {
        self.item = Some(resource);
        self
    }
}

/// What an emit managed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitReport {
    /// The broker accepted the event.
    pub published: bool,
    /// New version per bumped family; families whose bump failed are absent.
    pub bumped: Vec<(CacheFamily, u64)>,
    /// The item key was deleted (or was already absent).
    pub item_invalidated: bool,
}

/// Publishes events and invalidates local caches after a committed write.
#[derive(Clone)]
pub struct DomainEventProducer {
    bus: Arc<dyn EventBus>,
    cache: VersionedCache,
    clock: Arc<dyn Clock>,
    invalidation: Invalidation,
}

impl DomainEventProducer {
    /// New producer.
    #[must_use]
    pub fn new(
        bus: Arc<dyn EventBus>,
        cache: VersionedCache,
        clock: Arc<dyn Clock>,
        invalidation: Invalidation,
    ) -> Self {
        Self {
            bus,
            cache,
            clock,
            invalidation,
        }
    }

    /// Build an event stamped with the current time and emit it.
    pub async fn emit(
        &self,
        kind: EventKind,
        content_id: &str,
        actor_id: &str,
        payload: Map<String, Value>,
    ) -> EmitReport {
        let event = DomainEvent::new(kind, content_id, actor_id, payload, self.clock.now());
        self.emit_event(&event).await
    }

    /// Emit a prepared event. Never fails; see [`EmitReport`].
    pub async fn emit_event(&self, event: &DomainEvent) -> EmitReport {
        let published = self.publish(event).await;

        let mut bumped = Vec::with_capacity(self.invalidation.families.len());
        for family in &self.invalidation.families {
            match self.cache.bump_version(family).await {
                Ok(version) => bumped.push((family.clone(), version)),
                Err(error) => tracing::error!(
                    family = %family,
                    content_id = event.content_id(),
                    error = %error,
                    "Failed to bump cache version; entries stay valid until TTL"
                ),
            }
        }

        let item_invalidated = match &self.invalidation.item {
            None => false,
            Some(resource) => match self.cache.invalidate_item(resource, event.content_id()).await {
                Ok(_) => true,
                Err(error) => {
                    tracing::error!(
                        resource = %resource,
                        content_id = event.content_id(),
                        error = %error,
                        "Failed to invalidate cached item; it stays valid until TTL"
                    );
                    false
                }
            },
        };

        EmitReport {
            published,
            bumped,
            item_invalidated,
        }
    }

    async fn publish(&self, event: &DomainEvent) -> bool {
        let topic = event.kind().topic();
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(error) => {
                EventBusMetrics::record_publish_failure(topic);
                tracing::error!(topic, content_id = event.content_id(), error = %error, "Event not encodable");
                return false;
            }
        };

        match self.bus.publish(topic, &payload).await {
            Ok(()) => {
                EventBusMetrics::record_publish(topic);
                tracing::info!(topic, content_id = event.content_id(), "Event published");
                true
            }
            Err(error) => {
                EventBusMetrics::record_publish_failure(topic);
                tracing::error!(
                    topic,
                    content_id = event.content_id(),
                    actor_id = event.actor_id(),
                    error = %error,
                    "Event publish failed; event is lost"
                );
                false
            }
        }
    }
}
