//! End-to-end propagation over the in-memory bus and cache store.

#![allow(clippy::unwrap_used, clippy::panic)]

use async_trait::async_trait;
use ripple_core::event::DomainEvent;
use ripple_core::event_bus::EventBus;
use ripple_core::handler::{EventHandler, HandlerError, HandlerRegistry};
use ripple_core::keys::{CacheFamily, ItemResource};
use ripple_runtime::{
    DomainEventProducer, EventConsumer, Invalidation, RetryPolicy, ShutdownCoordinator,
    VersionedCache,
};
use ripple_testing::{InMemoryCacheStore, InMemoryEventBus, test_clock};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CONTENT_LIST: CacheFamily = CacheFamily::from_static("content-list");
const CONTENT: ItemResource = ItemResource::from_static("content");
const TTL: Duration = Duration::from_secs(300);

/// Set-backed consumer: upsert on create, remove-if-present on delete.
#[derive(Default)]
struct Projection {
    ids: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl EventHandler for Projection {
    fn name(&self) -> &str {
        "projection"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let mut ids = self.ids.lock().unwrap();
        match event.kind() {
            ripple_core::event::EventKind::ContentCreated => {
                ids.insert(event.content_id().to_string());
            }
            ripple_core::event::EventKind::ContentDeleted => {
                ids.remove(event.content_id());
            }
        }
        Ok(())
    }
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn listing_cache_moves_to_next_version_after_a_write() {
    let store = InMemoryCacheStore::new();
    let cache = VersionedCache::new(Arc::new(store.clone()));
    let bus = InMemoryEventBus::new();
    let producer = DomainEventProducer::new(
        Arc::new(bus.clone()),
        cache.clone(),
        Arc::new(test_clock()),
        Invalidation::none().family(CONTENT_LIST).item(CONTENT),
    );

    // Two earlier writes put the family at version 3.
    cache.bump_version(&CONTENT_LIST).await.unwrap();
    cache.bump_version(&CONTENT_LIST).await.unwrap();
    assert_eq!(cache.current_version(&CONTENT_LIST).await.unwrap(), 3);

    let page_one: Vec<String> = cache
        .get_or_load(&CONTENT_LIST, "1:10", TTL, || async { Ok::<_, String>(vec!["old".to_string()]) })
        .await
        .unwrap();
    assert_eq!(page_one, vec!["old"]);
    assert!(store.peek("content-list:v3:1:10").is_some());

    let event = DomainEvent::content_created("p1", "u1", "hello", &[], test_clock().now_fixed());
    let report = producer.emit_event(&event).await;
    assert_eq!(report.bumped, vec![(CONTENT_LIST, 4)]);

    let lookup = cache.get(&CONTENT_LIST, "1:10").await;
    assert!(!lookup.hit());
    assert_eq!(lookup.version, Some(4));

    let refreshed: Vec<String> = cache
        .get_or_load(&CONTENT_LIST, "1:10", TTL, || async {
            Ok::<_, String>(vec!["p1".to_string(), "old".to_string()])
        })
        .await
        .unwrap();
    assert_eq!(refreshed.len(), 2);
    assert!(store.peek("content-list:v4:1:10").is_some());
    // The old entry is unreachable but still present until its TTL.
    assert!(store.peek("content-list:v3:1:10").is_some());
}

#[tokio::test]
async fn events_reach_every_live_subscriber_and_redelivery_is_harmless() {
    let bus = InMemoryEventBus::new();
    let shared: Arc<dyn EventBus> = Arc::new(bus.clone());
    let cache = VersionedCache::new(Arc::new(InMemoryCacheStore::new()));
    let producer = DomainEventProducer::new(
        Arc::clone(&shared),
        cache,
        Arc::new(test_clock()),
        Invalidation::none(),
    );

    let first = Arc::new(Projection::default());
    let second = Arc::new(Projection::default());
    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
    let signal = coordinator.signal();
    let policy = RetryPolicy::builder().initial_delay(Duration::from_millis(1)).build();

    for projection in [&first, &second] {
        let registry = HandlerRegistry::new()
            .with("content.#", Arc::clone(projection) as Arc<dyn EventHandler>)
            .unwrap();
        for consumer in EventConsumer::from_registry(&registry, &shared, &signal, &policy) {
            let task = consumer.spawn();
            coordinator.track("projection", tokio::spawn(async move {
                task.await.unwrap();
            }));
        }
    }
    eventually(|| bus.subscriber_count() == 2).await;

    let created = DomainEvent::content_created("p1", "u1", "hello", &[], test_clock().now_fixed());
    producer.emit_event(&created).await;
    // Simulated redelivery of the same event.
    bus.publish("content.created", &created.encode().unwrap()).await.unwrap();
    producer
        .emit_event(&DomainEvent::content_created("p2", "u1", "more", &[], test_clock().now_fixed()))
        .await;
    eventually(|| bus.acked() == 6).await;

    for projection in [&first, &second] {
        let ids = projection.ids.lock().unwrap().clone();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["p1", "p2"]);
    }

    let deleted = DomainEvent::content_deleted("p1", "u1", &[], test_clock().now_fixed());
    producer.emit_event(&deleted).await;
    producer.emit_event(&deleted).await;
    eventually(|| bus.acked() == 10).await;
    assert_eq!(first.ids.lock().unwrap().len(), 1);
    assert_eq!(second.ids.lock().unwrap().len(), 1);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn late_subscribers_miss_earlier_events() {
    let bus = InMemoryEventBus::new();
    bus.publish(
        "content.created",
        &DomainEvent::content_created("p1", "u1", "hello", &[], test_clock().now_fixed())
            .encode()
            .unwrap(),
    )
    .await
    .unwrap();

    let projection = Arc::new(Projection::default());
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
    let task = EventConsumer::new(
        ripple_core::topic::TopicPattern::parse("content.*").unwrap(),
        Arc::new(bus.clone()),
        Arc::clone(&projection) as Arc<dyn EventHandler>,
        coordinator.signal(),
    )
    .spawn();
    eventually(|| bus.subscriber_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    coordinator.shutdown().await.unwrap();
    assert_eq!(task.await.unwrap().handled, 0);
    assert!(projection.ids.lock().unwrap().is_empty());
}
