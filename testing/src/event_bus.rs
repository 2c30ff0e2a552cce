//! In-memory topic exchange.
//!
//! Behaves like the broker-backed bus as far as consumers can tell:
//!
//! - every live subscription whose pattern matches gets its own copy
//! - nothing is retained for subscriptions opened after publish
//! - one delivery in flight per subscription; the next is handed out only
//!   after the previous one is settled
//! - `requeue` redelivers with `attempt + 1`, up to `max_redeliveries`
//!   extra attempts, after which the message is dropped
//!
//! Every publish is also recorded so tests can assert on what was emitted.

#![allow(clippy::unwrap_used)] // Lock poisoning only follows an earlier panic
#![allow(clippy::missing_panics_doc)]

use ripple_core::event::{DomainEvent, EventError};
use ripple_core::event_bus::{
    AckOutcome, Acknowledger, Delivery, DeliveryStream, EventBus, EventBusError,
};
use ripple_core::topic::{self, TopicPattern};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Default number of redeliveries before a requeued message is dropped.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;

/// A message accepted by [`InMemoryEventBus::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Routing key.
    pub topic: String,
    /// Body.
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    /// Decode the body as a [`DomainEvent`].
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the body is not a valid event.
    pub fn event(&self) -> Result<DomainEvent, EventError> {
        DomainEvent::decode(&self.payload)
    }
}

#[derive(Debug, Clone)]
struct Message {
    topic: String,
    payload: Vec<u8>,
    attempt: u32,
}

struct Binding {
    pattern: TopicPattern,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Settlements {
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

impl Settlements {
    fn record(&self, outcome: AckOutcome, attempt: u32, max_redeliveries: u32) -> AckOutcome {
        let counter = match outcome {
            AckOutcome::Ack => &self.acked,
            AckOutcome::Requeue if attempt <= max_redeliveries => &self.requeued,
            AckOutcome::Requeue => &self.dropped,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        outcome
    }
}

/// In-memory [`EventBus`] with topic-exchange semantics.
#[derive(Clone)]
pub struct InMemoryEventBus {
    bindings: Arc<Mutex<Vec<Binding>>>,
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    fail_next: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
    settlements: Arc<Settlements>,
    max_redeliveries: u32,
}

impl InMemoryEventBus {
    /// Bus with the default redelivery bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_redeliveries(DEFAULT_MAX_REDELIVERIES)
    }

    /// Bus that drops a message after `max_redeliveries` requeues.
    #[must_use]
    pub fn with_max_redeliveries(max_redeliveries: u32) -> Self {
        Self {
            bindings: Arc::new(Mutex::new(Vec::new())),
            published: Arc::new(Mutex::new(Vec::new())),
            fail_next: Arc::new(AtomicU32::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            settlements: Arc::new(Settlements::default()),
            max_redeliveries,
        }
    }

    /// Make the next `count` publishes fail as if the broker were down.
    pub fn fail_next_publishes(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Every message accepted so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Accepted messages decoded as events. Undecodable ones are skipped.
    #[must_use]
    pub fn published_events(&self) -> Vec<DomainEvent> {
        self.published()
            .iter()
            .filter_map(|message| message.event().ok())
            .collect()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut bindings = self.bindings.lock().unwrap();
        bindings.retain(|binding| !binding.sender.is_closed());
        bindings.len()
    }

    /// Deliveries acknowledged so far.
    #[must_use]
    pub fn acked(&self) -> u64 {
        self.settlements.acked.load(Ordering::SeqCst)
    }

    /// Deliveries requeued so far.
    #[must_use]
    pub fn requeued(&self) -> u64 {
        self.settlements.requeued.load(Ordering::SeqCst)
    }

    /// Messages dropped after exhausting redeliveries.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.settlements.dropped.load(Ordering::SeqCst)
    }

    /// End every open subscription without closing the bus, as a lost
    /// broker connection would. New subscriptions still work.
    pub fn disconnect_all(&self) {
        self.bindings.lock().unwrap().clear();
    }

    /// Publish without going through the event type; handy for malformed payloads.
    ///
    /// # Errors
    ///
    /// Same as [`EventBus::publish`].
    pub fn publish_raw(&self, routing_key: &str, payload: &[u8]) -> Result<usize, EventBusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }
        topic::validate_routing_key(routing_key)
            .map_err(|e| EventBusError::InvalidTopic(e.to_string()))?;

        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(EventBusError::PublishFailed {
                topic: routing_key.to_string(),
                reason: "injected broker failure".to_string(),
            });
        }

        self.published.lock().unwrap().push(PublishedMessage {
            topic: routing_key.to_string(),
            payload: payload.to_vec(),
        });

        let mut delivered = 0;
        let mut bindings = self.bindings.lock().unwrap();
        bindings.retain(|binding| {
            if !binding.pattern.matches(routing_key) {
                return !binding.sender.is_closed();
            }
            let message = Message {
                topic: routing_key.to_string(),
                payload: payload.to_vec(),
                attempt: 1,
            };
            let sent = binding.sender.send(message).is_ok();
            if sent {
                delivered += 1;
            }
            sent
        });

        tracing::debug!(topic = routing_key, subscribers = delivered, "Published to in-memory bus");
        Ok(delivered)
    }

    fn open_stream(&self, pattern: TopicPattern) -> DeliveryStream {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.bindings.lock().unwrap().push(Binding { pattern, sender });

        let settlements = Arc::clone(&self.settlements);
        let max_redeliveries = self.max_redeliveries;

        Box::pin(async_stream::stream! {
            let mut redeliveries: VecDeque<Message> = VecDeque::new();
            loop {
                let message = match redeliveries.pop_front() {
                    Some(message) => message,
                    None => match receiver.recv().await {
                        Some(message) => message,
                        None => break,
                    },
                };

                let (settle_tx, settle_rx) = oneshot::channel();
                let acker = OneshotAcker {
                    sender: settle_tx,
                    settlements: Arc::clone(&settlements),
                    attempt: message.attempt,
                    max_redeliveries,
                };
                yield Ok::<_, EventBusError>(Delivery::new(
                    message.topic.clone(),
                    message.payload.clone(),
                    message.attempt,
                    Box::new(acker),
                ));

                // Settled deliveries were counted by the acker. One dropped
                // without settlement goes back to the queue.
                let outcome = match settle_rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => settlements.record(AckOutcome::Requeue, message.attempt, max_redeliveries),
                };
                match outcome {
                    AckOutcome::Ack => {}
                    AckOutcome::Requeue if message.attempt <= max_redeliveries => {
                        redeliveries.push_back(Message {
                            attempt: message.attempt + 1,
                            ..message
                        });
                    }
                    AckOutcome::Requeue => {
                        tracing::warn!(
                            topic = %message.topic,
                            attempts = message.attempt,
                            "Dropping message after exhausting redeliveries"
                        );
                    }
                }
            }
        })
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

struct OneshotAcker {
    sender: oneshot::Sender<AckOutcome>,
    settlements: Arc<Settlements>,
    attempt: u32,
    max_redeliveries: u32,
}

impl Acknowledger for OneshotAcker {
    fn settle(self: Box<Self>, outcome: AckOutcome) -> Result<(), EventBusError> {
        self.sender
            .send(outcome)
            .map_err(|_| EventBusError::AckFailed("subscription is gone".to_string()))?;
        self.settlements.record(outcome, self.attempt, self.max_redeliveries);
        Ok(())
    }
}

impl EventBus for InMemoryEventBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>> {
        Box::pin(async move { self.publish_raw(topic, payload).map(|_| ()) })
    }

    fn subscribe(
        &self,
        pattern: TopicPattern,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(EventBusError::Closed);
            }
            Ok(self.open_stream(pattern))
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            // Dropping the senders ends every open stream once its queue drains.
            self.bindings.lock().unwrap().clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;

    fn pattern(raw: &str) -> TopicPattern {
        TopicPattern::parse(raw).unwrap()
    }

    fn created() -> Vec<u8> {
        DomainEvent::content_created("p1", "u1", "hi", &[], Utc::now())
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn fans_out_to_matching_subscriptions_only() {
        let bus = InMemoryEventBus::new();
        let mut all = bus.subscribe(pattern("content.*")).await.unwrap();
        let mut deleted = bus.subscribe(pattern("content.deleted")).await.unwrap();

        bus.publish("content.created", &created()).await.unwrap();
        bus.publish("content.deleted", b"{}").await.unwrap();

        let first = all.next().await.unwrap().unwrap();
        assert_eq!(first.routing_key(), "content.created");
        first.ack().unwrap();
        let second = all.next().await.unwrap().unwrap();
        assert_eq!(second.routing_key(), "content.deleted");
        second.ack().unwrap();

        let only = deleted.next().await.unwrap().unwrap();
        assert_eq!(only.routing_key(), "content.deleted");
        only.ack().unwrap();

        assert_eq!(bus.published().len(), 2);
        assert_eq!(bus.acked(), 3);
    }

    #[tokio::test]
    async fn settlements_are_counted_without_polling_again() {
        let bus = InMemoryEventBus::with_max_redeliveries(0);
        let mut stream = bus.subscribe(pattern("content.created")).await.unwrap();

        bus.publish("content.created", &created()).await.unwrap();
        stream.next().await.unwrap().unwrap().ack().unwrap();
        assert_eq!(bus.acked(), 1);

        bus.publish("content.created", &created()).await.unwrap();
        stream.next().await.unwrap().unwrap().requeue().unwrap();
        assert_eq!(bus.dropped(), 1);
        assert_eq!(bus.requeued(), 0);
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_messages() {
        let bus = InMemoryEventBus::new();
        bus.publish("content.created", &created()).await.unwrap();

        let mut late = bus.subscribe(pattern("#")).await.unwrap();
        bus.close().await.unwrap();
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn requeue_redelivers_until_bound() {
        let bus = InMemoryEventBus::with_max_redeliveries(2);
        let mut stream = bus.subscribe(pattern("content.created")).await.unwrap();
        bus.publish("content.created", &created()).await.unwrap();

        for expected_attempt in 1..=3 {
            let delivery = stream.next().await.unwrap().unwrap();
            assert_eq!(delivery.attempt(), expected_attempt);
            delivery.requeue().unwrap();
        }

        bus.publish("content.created", &created()).await.unwrap();
        let fresh = stream.next().await.unwrap().unwrap();
        assert_eq!(fresh.attempt(), 1);
        fresh.ack().unwrap();

        assert_eq!(bus.requeued(), 2);
        assert_eq!(bus.dropped(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_not_recorded() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(1);

        let err = bus.publish("content.created", &created()).await.unwrap_err();
        assert!(matches!(err, EventBusError::PublishFailed { .. }));
        bus.publish("content.created", &created()).await.unwrap();

        assert_eq!(bus.published_events().len(), 1);
    }

    #[tokio::test]
    async fn rejects_wildcard_routing_keys_and_publish_after_close() {
        let bus = InMemoryEventBus::new();
        assert!(matches!(
            bus.publish("content.*", b"{}").await,
            Err(EventBusError::InvalidTopic(_))
        ));

        bus.close().await.unwrap();
        assert_eq!(bus.publish("content.created", b"{}").await, Err(EventBusError::Closed));
        assert!(bus.subscribe(pattern("#")).await.is_err());
    }
}
