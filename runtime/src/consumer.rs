//! Event consumption loop with automatic resubscription.
//!
//! One [`EventConsumer`] runs per registered pattern. It owns the
//! subscribe-process-resubscribe loop so handlers only deal with events:
//!
//! ```text
//! loop {
//!     subscribe(pattern)            -- backoff and retry on failure
//!     for each delivery, in order:
//!         dispatch to the handler
//!         Handled  -> ack
//!         Retry    -> requeue       -- broker redelivers later
//!         Discard  -> ack + log     -- never poison the subscription
//!     stream ended -> backoff, resubscribe
//! }
//! ```
//!
//! Deliveries from one subscription are handled strictly one at a time. The
//! shutdown signal is only observed between deliveries, so a handler that
//! has started always runs to completion and settles its delivery.

use crate::metrics::ConsumerMetrics;
use crate::retry::{Backoff, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use futures::StreamExt;
use ripple_core::event_bus::{Delivery, DeliveryStream, EventBus, EventBusError};
use ripple_core::handler::{Disposition, EventHandler, HandlerRegistry, dispatch};
use ripple_core::topic::TopicPattern;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

/// Counters a consumer reports when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries handled and acknowledged.
    pub handled: u64,
    /// Deliveries requeued after a transient failure.
    pub retried: u64,
    /// Deliveries acknowledged without effect.
    pub discarded: u64,
    /// Successful subscriptions, including the first.
    pub subscriptions: u64,
}

/// A required builder field was not set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("EventConsumer is missing '{0}'")]
pub struct MissingField(pub &'static str);

enum StreamEnd {
    Shutdown,
    Ended,
}

/// Subscribes one handler to one pattern and feeds it deliveries.
pub struct EventConsumer {
    name: String,
    pattern: TopicPattern,
    event_bus: Arc<dyn EventBus>,
    handler: Arc<dyn EventHandler>,
    shutdown: ShutdownSignal,
    backoff: Backoff,
    stats: ConsumerStats,
}

impl EventConsumer {
    /// Consumer named after its handler, with the default resubscribe policy.
    #[must_use]
    pub fn new(
        pattern: TopicPattern,
        event_bus: Arc<dyn EventBus>,
        handler: Arc<dyn EventHandler>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            name: handler.name().to_string(),
            pattern,
            event_bus,
            handler,
            shutdown,
            backoff: Backoff::new(RetryPolicy::default()),
            stats: ConsumerStats::default(),
        }
    }

    /// Start configuring a consumer.
    #[must_use]
    pub fn builder() -> EventConsumerBuilder {
        EventConsumerBuilder::default()
    }

    /// One consumer per registry binding, all sharing `event_bus` and `shutdown`.
    #[must_use]
    pub fn from_registry(
        registry: &HandlerRegistry,
        event_bus: &Arc<dyn EventBus>,
        shutdown: &ShutdownSignal,
        resubscribe: &RetryPolicy,
    ) -> Vec<Self> {
        registry
            .routes()
            .map(|(pattern, handler)| {
                Self::new(
                    pattern.clone(),
                    Arc::clone(event_bus),
                    Arc::clone(handler),
                    shutdown.clone(),
                )
                .with_resubscribe_policy(resubscribe.clone())
            })
            .collect()
    }

    /// Delay policy between failed or ended subscriptions.
    #[must_use]
    pub fn with_resubscribe_policy(mut self, policy: RetryPolicy) -> Self {
        self.backoff = Backoff::new(policy);
        self
    }

    /// Consumer name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound pattern.
    #[must_use]
    pub const fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// Run the loop on a background task.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<ConsumerStats> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown.
    pub async fn run(mut self) -> ConsumerStats {
        info!(consumer = %self.name, pattern = %self.pattern, "Event consumer started");

        while !self.shutdown.is_triggered() {
            let subscribed = tokio::select! {
                biased;
                () = self.shutdown.triggered() => break,
                subscribed = self.event_bus.subscribe(self.pattern.clone()) => subscribed,
            };

            match subscribed {
                Ok(mut stream) => {
                    self.stats.subscriptions += 1;
                    self.backoff.reset();
                    info!(consumer = %self.name, pattern = %self.pattern, "Subscribed to event bus");

                    if let StreamEnd::Shutdown = self.process_stream(&mut stream).await {
                        break;
                    }
                    warn!(consumer = %self.name, "Delivery stream ended, resubscribing");
                }
                Err(error) => {
                    error!(
                        consumer = %self.name,
                        pattern = %self.pattern,
                        error = %error,
                        attempt = self.backoff.attempts() + 1,
                        "Failed to subscribe to event bus"
                    );
                }
            }

            let delay = self.backoff.next_delay();
            tokio::select! {
                biased;
                () = self.shutdown.triggered() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            consumer = %self.name,
            handled = self.stats.handled,
            retried = self.stats.retried,
            discarded = self.stats.discarded,
            "Event consumer stopped"
        );
        self.stats
    }

    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                () = self.shutdown.triggered() => {
                    info!(consumer = %self.name, "Shutdown requested, leaving subscription");
                    return StreamEnd::Shutdown;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(EventBusError::Closed)) | None => return StreamEnd::Ended,
                Some(Err(error)) => {
                    error!(consumer = %self.name, error = %error, "Error receiving delivery");
                }
            }
        }
    }

    async fn process(&mut self, delivery: Delivery) {
        let started = Instant::now();
        let disposition = dispatch(self.handler.as_ref(), delivery.routing_key(), delivery.payload()).await;
        ConsumerMetrics::record_duration(&self.name, started.elapsed());

        let routing_key = delivery.routing_key().to_string();
        let attempt = delivery.attempt();

        let settled = match &disposition {
            Disposition::Handled => {
                self.stats.handled += 1;
                ConsumerMetrics::record_ack(&self.name);
                delivery.ack()
            }
            Disposition::Retry(reason) => {
                self.stats.retried += 1;
                ConsumerMetrics::record_requeue(&self.name);
                warn!(
                    consumer = %self.name,
                    routing_key = %routing_key,
                    attempt,
                    reason = %reason,
                    "Transient handler failure, requeueing"
                );
                delivery.requeue()
            }
            Disposition::Discard(reason) => {
                self.stats.discarded += 1;
                ConsumerMetrics::record_discard(&self.name);
                error!(
                    consumer = %self.name,
                    routing_key = %routing_key,
                    attempt,
                    reason = %reason,
                    "Discarding delivery"
                );
                delivery.ack()
            }
        };

        if let Err(error) = settled {
            error!(
                consumer = %self.name,
                routing_key = %routing_key,
                error = %error,
                "Failed to settle delivery; the broker will redeliver it"
            );
        }
    }
}

/// Builder for [`EventConsumer`].
#[derive(Default)]
pub struct EventConsumerBuilder {
    name: Option<String>,
    pattern: Option<TopicPattern>,
    event_bus: Option<Arc<dyn EventBus>>,
    handler: Option<Arc<dyn EventHandler>>,
    shutdown: Option<ShutdownSignal>,
    resubscribe: Option<RetryPolicy>,
}

impl EventConsumerBuilder {
    /// Override the name (defaults to the handler's).
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Pattern to bind.
    #[must_use]
    pub fn pattern(mut self, pattern: TopicPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Bus to subscribe on.
    #[must_use]
    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Handler to feed.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Shutdown signal to observe.
    #[must_use]
    pub fn shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Resubscribe backoff (default [`RetryPolicy::default`]).
    #[must_use]
    pub fn resubscribe_policy(mut self, policy: RetryPolicy) -> Self {
        self.resubscribe = Some(policy);
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`MissingField`] if pattern, bus, handler or shutdown is unset.
    pub fn build(self) -> Result<EventConsumer, MissingField> {
        let pattern = self.pattern.ok_or(MissingField("pattern"))?;
        let event_bus = self.event_bus.ok_or(MissingField("event_bus"))?;
        let handler = self.handler.ok_or(MissingField("handler"))?;
        let shutdown = self.shutdown.ok_or(MissingField("shutdown"))?;

        let mut consumer = EventConsumer::new(pattern, event_bus, handler, shutdown)
            .with_resubscribe_policy(self.resubscribe.unwrap_or_default());
        if let Some(name) = self.name {
            consumer.name = name;
        }
        Ok(consumer)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownCoordinator;
    use async_trait::async_trait;
    use ripple_core::event::DomainEvent;
    use ripple_core::handler::HandlerError;
    use ripple_testing::{InMemoryEventBus, test_clock};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
        failures: Mutex<Vec<HandlerError>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
            self.seen
                .lock()
                .unwrap()
                .push((event.kind().topic().to_string(), event.content_id().to_string()));
            match self.failures.lock().unwrap().pop() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build()
    }

    fn created(id: &str) -> Vec<u8> {
        DomainEvent::content_created(id, "u1", "hello", &[], test_clock().now_fixed())
            .encode()
            .unwrap()
    }

    async fn wait_for_subscribers(bus: &InMemoryEventBus, count: usize) {
        for _ in 0..200 {
            if bus.subscriber_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subscribers never appeared");
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    fn consumer(
        bus: &InMemoryEventBus,
        handler: Arc<Recorder>,
        coordinator: &ShutdownCoordinator,
    ) -> EventConsumer {
        EventConsumer::builder()
            .pattern(TopicPattern::parse("content.*").unwrap())
            .event_bus(Arc::new(bus.clone()))
            .handler(handler)
            .shutdown(coordinator.signal())
            .resubscribe_policy(fast())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn handles_and_acks_matching_deliveries() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(Recorder::default());
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let task = consumer(&bus, Arc::clone(&handler), &coordinator).spawn();
        wait_for_subscribers(&bus, 1).await;

        bus.publish("content.created", &created("p1")).await.unwrap();
        bus.publish("content.created", &created("p2")).await.unwrap();
        wait_until(|| bus.acked() == 2).await;

        coordinator.shutdown().await.unwrap();
        let stats = task.await.unwrap();
        assert_eq!(stats.handled, 2);
        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen[0].1, "p1");
        assert_eq!(seen[1].1, "p2");
    }

    #[tokio::test]
    async fn transient_failure_is_requeued_and_redelivered() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(Recorder::default());
        handler
            .failures
            .lock()
            .unwrap()
            .push(HandlerError::Transient("store down".to_string()));
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let task = consumer(&bus, Arc::clone(&handler), &coordinator).spawn();
        wait_for_subscribers(&bus, 1).await;

        bus.publish("content.created", &created("p1")).await.unwrap();
        wait_until(|| bus.acked() == 1).await;

        coordinator.shutdown().await.unwrap();
        let stats = task.await.unwrap();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.handled, 1);
        assert_eq!(bus.requeued(), 1);
        assert_eq!(handler.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn malformed_and_permanent_failures_are_acked_and_loop_continues() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(Recorder::default());
        handler
            .failures
            .lock()
            .unwrap()
            .push(HandlerError::Permanent("bad media ids".to_string()));
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let task = consumer(&bus, Arc::clone(&handler), &coordinator).spawn();
        wait_for_subscribers(&bus, 1).await;

        bus.publish_raw("content.created", b"{not json").unwrap();
        bus.publish("content.created", &created("p1")).await.unwrap();
        bus.publish("content.created", &created("p2")).await.unwrap();
        wait_until(|| bus.acked() == 3).await;

        coordinator.shutdown().await.unwrap();
        let stats = task.await.unwrap();
        assert_eq!(stats.discarded, 2);
        assert_eq!(stats.handled, 1);
        assert_eq!(bus.requeued(), 0);
    }

    #[tokio::test]
    async fn non_matching_routing_keys_never_reach_the_handler() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(Recorder::default());
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let task = EventConsumer::builder()
            .pattern(TopicPattern::parse("content.deleted").unwrap())
            .event_bus(Arc::new(bus.clone()))
            .handler(Arc::clone(&handler) as Arc<dyn EventHandler>)
            .shutdown(coordinator.signal())
            .build()
            .unwrap()
            .spawn();
        wait_for_subscribers(&bus, 1).await;

        bus.publish("content.created", &created("p1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        coordinator.shutdown().await.unwrap();
        assert_eq!(task.await.unwrap().handled, 0);
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resubscribes_after_the_stream_ends() {
        let bus = InMemoryEventBus::new();
        let handler = Arc::new(Recorder::default());
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let shared: Arc<dyn EventBus> = Arc::new(bus.clone());
        let signal = coordinator.signal();

        let mut consumers = EventConsumer::from_registry(
            &HandlerRegistry::new()
                .with("content.created", Arc::clone(&handler) as Arc<dyn EventHandler>)
                .unwrap(),
            &shared,
            &signal,
            &fast(),
        );
        assert_eq!(consumers.len(), 1);
        let consumer = consumers.remove(0);
        assert_eq!(consumer.name(), "recorder");
        let task = consumer.spawn();
        wait_for_subscribers(&bus, 1).await;

        bus.disconnect_all();
        assert_eq!(bus.subscriber_count(), 0);
        wait_for_subscribers(&bus, 1).await;

        bus.publish("content.created", &created("p1")).await.unwrap();
        wait_until(|| bus.acked() == 1).await;

        coordinator.shutdown().await.unwrap();
        let stats = task.await.unwrap();
        assert_eq!(stats.subscriptions, 2);
        assert_eq!(stats.handled, 1);
    }

    #[tokio::test]
    async fn closed_bus_keeps_consumer_retrying_until_shutdown() {
        let bus = InMemoryEventBus::new();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let task = consumer(&bus, Arc::new(Recorder::default()), &coordinator).spawn();
        wait_for_subscribers(&bus, 1).await;

        bus.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        coordinator.shutdown().await.unwrap();
        assert_eq!(task.await.unwrap().subscriptions, 1);
    }

    #[tokio::test]
    async fn shutdown_before_subscribe_stops_immediately() {
        let bus = InMemoryEventBus::new();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let consumer = consumer(&bus, Arc::new(Recorder::default()), &coordinator);
        coordinator.shutdown().await.unwrap();

        let stats = consumer.run().await;
        assert_eq!(stats, ConsumerStats::default());
    }

    #[test]
    fn builder_reports_missing_fields() {
        let error = EventConsumer::builder().build().err().unwrap();
        assert_eq!(error, MissingField("pattern"));
    }
}
