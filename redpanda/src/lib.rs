//! Topic-exchange event bus over a Kafka-compatible broker.
//!
//! Implements [`EventBus`] from `ripple-core` with rdkafka. Works against
//! Redpanda, Apache Kafka or any other broker speaking the Kafka protocol.
//!
//! # Mapping
//!
//! ```text
//!  publish("content.created", bytes)
//!        │  key = routing key, header routing-key = routing key
//!        ▼
//!  ┌──────────────────────────┐
//!  │ exchange topic           │  one per deployment (default social_events)
//!  └────────────┬─────────────┘
//!               │ every subscription is its own consumer group
//!       ┌───────┴────────┐
//!       ▼                ▼
//!  group search-<uuid>   group media-<uuid>
//!  pattern content.*     pattern content.deleted   (matched in process)
//! ```
//!
//! - **Fan-out**: each subscription gets a fresh, uniquely named consumer
//!   group starting at the latest offset, so every live subscriber receives
//!   its own copy and nothing survives a restart.
//! - **Sequential delivery**: one delivery per subscription is in flight; the
//!   next record is read only after the previous one is settled.
//! - **Acknowledgement**: `ack` commits the offset. `requeue` hands the same
//!   record out again after a backoff, up to `max_redeliveries` extra
//!   attempts; after that it is logged and committed.
//! - **Reconnect**: a failed publish drops the producer; the next publish
//!   builds a new one. Subscriptions that end are re-established by the
//!   consumption loop.
//!
//! A subscriber that is down while events are published misses them. There
//! is no replay.
//!
//! # Example
//!
//! ```no_run
//! use ripple_redpanda::RedpandaEventBus;
//! use ripple_core::event_bus::EventBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .exchange("social_events")
//!     .service("search")
//!     .connect()
//!     .await?;
//!
//! bus.publish("content.created", br#"{"kind":"content.created"}"#).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod subscription;

pub use subscription::ROUTING_KEY_HEADER;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use ripple_core::event_bus::{DeliveryStream, EventBus, EventBusError};
use ripple_core::topic::{self, TopicPattern};
use ripple_runtime::retry::{RetryPolicy, retry_with_predicate};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use subscription::Redelivery;
use tokio::sync::{mpsc, watch};

/// Default exchange topic.
pub const DEFAULT_EXCHANGE: &str = "social_events";

/// Default number of redeliveries before a requeued record is dropped.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 5;

/// Event bus on a Kafka-compatible broker.
///
/// Construct with [`RedpandaEventBus::builder`]. Share one instance per
/// process as `Arc<dyn EventBus>`.
pub struct RedpandaEventBus {
    brokers: String,
    exchange: String,
    service: String,
    timeout: Duration,
    producer_acks: String,
    compression: String,
    partitions: i32,
    replication: i32,
    redelivery: Redelivery,
    connect_policy: RetryPolicy,
    producer: Mutex<Option<FutureProducer>>,
    closed: watch::Sender<bool>,
}

impl RedpandaEventBus {
    /// Start configuring a bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Exchange topic name.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Declare the exchange and open the producer, retrying with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] once the connect policy is
    /// exhausted. Callers treat this as fatal at startup.
    pub async fn connect(&self) -> Result<(), EventBusError> {
        tracing::info!(brokers = %self.brokers, exchange = %self.exchange, "Connecting to broker");

        retry_with_predicate(
            &self.connect_policy,
            || self.declare_exchange(),
            |error| !matches!(error, EventBusError::Closed),
        )
        .await
        .map_err(|error| EventBusError::ConnectionFailed(error.to_string()))?;

        self.producer()?;
        tracing::info!(brokers = %self.brokers, exchange = %self.exchange, "Connected to broker");
        Ok(())
    }

    async fn declare_exchange(&self) -> Result<(), EventBusError> {
        let admin: AdminClient<DefaultClientContext> = self
            .base_config()
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create admin client: {e}")))?;

        let topic = NewTopic::new(&self.exchange, self.partitions, TopicReplication::Fixed(self.replication));
        let options = AdminOptions::new().request_timeout(Some(self.timeout));

        let results = tokio::time::timeout(self.timeout * 2, admin.create_topics(&[topic], &options))
            .await
            .map_err(|_| EventBusError::ConnectionFailed("Timed out declaring exchange".to_string()))?
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to declare exchange: {e}")))?;

        for result in results {
            match result {
                Ok(name) => tracing::info!(exchange = %name, "Exchange declared"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    tracing::debug!(exchange = %name, "Exchange already exists");
                }
                Err((name, code)) => {
                    return Err(EventBusError::ConnectionFailed(format!(
                        "Failed to declare exchange '{name}': {code}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        config
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = self.base_config();
        config
            .set("message.timeout.ms", self.timeout.as_millis().to_string())
            .set("acks", &self.producer_acks)
            .set("compression.type", &self.compression);
        config
    }

    fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = self.base_config();
        config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false");
        config
    }

    fn group_id(&self) -> String {
        format!("{}-{}", self.service, uuid::Uuid::new_v4())
    }

    /// Current producer, building one if the last was dropped.
    fn producer(&self) -> Result<FutureProducer, EventBusError> {
        let mut slot = self
            .producer
            .lock()
            .map_err(|_| EventBusError::TransportError("producer lock poisoned".to_string()))?;
        if let Some(producer) = slot.as_ref() {
            return Ok(producer.clone());
        }

        let producer: FutureProducer = self
            .producer_config()
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;
        tracing::info!(brokers = %self.brokers, "Producer connected");
        *slot = Some(producer.clone());
        Ok(producer)
    }

    fn drop_producer(&self, error: &KafkaError) {
        if let Ok(mut slot) = self.producer.lock() {
            if slot.take().is_some() {
                tracing::warn!(
                    brokers = %self.brokers,
                    error = %error,
                    "Producer connection lost, reconnecting on next publish"
                );
            }
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl EventBus for RedpandaEventBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(EventBusError::Closed);
            }
            topic::validate_routing_key(topic).map_err(|e| EventBusError::InvalidTopic(e.to_string()))?;

            let producer = self.producer()?;
            let headers = OwnedHeaders::new().insert(Header {
                key: ROUTING_KEY_HEADER,
                value: Some(topic),
            });
            let record = FutureRecord::to(&self.exchange)
                .key(topic)
                .payload(payload)
                .headers(headers);

            match producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        exchange = %self.exchange,
                        routing_key = topic,
                        partition,
                        offset,
                        "Published"
                    );
                    Ok(())
                }
                Err((error, _)) => {
                    self.drop_producer(&error);
                    Err(EventBusError::PublishFailed {
                        topic: topic.to_string(),
                        reason: error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        pattern: TopicPattern,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(EventBusError::Closed);
            }

            let group_id = self.group_id();
            let subscription_failed = |reason: String| EventBusError::SubscriptionFailed {
                pattern: pattern.as_str().to_string(),
                reason,
            };

            let consumer: StreamConsumer = self
                .consumer_config(&group_id)
                .create()
                .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;
            consumer
                .subscribe(&[self.exchange.as_str()])
                .map_err(|e| subscription_failed(format!("Failed to subscribe: {e}")))?;

            tracing::info!(
                exchange = %self.exchange,
                pattern = %pattern,
                group = %group_id,
                "Subscription bound"
            );

            let (sender, mut receiver) = mpsc::channel(1);
            tokio::spawn(subscription::pump(
                consumer,
                pattern,
                group_id,
                sender,
                self.closed.subscribe(),
                self.redelivery.clone(),
            ));

            let stream = async_stream::stream! {
                while let Some(item) = receiver.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(async move {
            self.closed.send_replace(true);

            let producer = self.producer.lock().ok().and_then(|mut slot| slot.take());
            let Some(producer) = producer else {
                tracing::info!(brokers = %self.brokers, "Event bus closed");
                return Ok(());
            };

            let timeout = self.timeout;
            let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| EventBusError::TransportError(format!("Flush task failed: {e}")))?;
            flushed.map_err(|e| EventBusError::TransportError(format!("Failed to flush producer: {e}")))?;

            tracing::info!(brokers = %self.brokers, "Event bus closed");
            Ok(())
        })
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    exchange: Option<String>,
    service: Option<String>,
    timeout: Option<Duration>,
    producer_acks: Option<String>,
    compression: Option<String>,
    partitions: Option<i32>,
    replication: Option<i32>,
    max_redeliveries: Option<u32>,
    redelivery_backoff: Option<RetryPolicy>,
    connect_policy: Option<RetryPolicy>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Exchange topic (default [`DEFAULT_EXCHANGE`]).
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Service name used as the consumer group prefix (default `ripple`).
    #[must_use]
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Bound for every broker operation (default 5 s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Producer acknowledgement mode: `"0"`, `"1"` or `"all"` (default `"all"`).
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec (default `"none"`).
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Partitions and replication factor used when declaring the exchange
    /// (default 1 and 1). One partition keeps a single total order.
    #[must_use]
    pub const fn topology(mut self, partitions: i32, replication: i32) -> Self {
        self.partitions = Some(partitions);
        self.replication = Some(replication);
        self
    }

    /// Redeliveries before a requeued record is dropped
    /// (default [`DEFAULT_MAX_REDELIVERIES`]).
    #[must_use]
    pub const fn max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = Some(max);
        self
    }

    /// Delay sequence between redeliveries (default 500 ms doubling to 30 s).
    #[must_use]
    pub fn redelivery_backoff(mut self, policy: RetryPolicy) -> Self {
        self.redelivery_backoff = Some(policy);
        self
    }

    /// Retry policy for [`RedpandaEventBus::connect`]
    /// (default [`RetryPolicy::default`]).
    #[must_use]
    pub fn connect_policy(mut self, policy: RetryPolicy) -> Self {
        self.connect_policy = Some(policy);
        self
    }

    /// Build without touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the exchange name is empty.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .filter(|brokers| !brokers.trim().is_empty())
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let exchange = self.exchange.unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());
        if exchange.trim().is_empty() {
            return Err(EventBusError::ConnectionFailed("Exchange name is empty".to_string()));
        }

        let (closed, _) = watch::channel(false);
        Ok(RedpandaEventBus {
            brokers,
            exchange,
            service: self.service.unwrap_or_else(|| "ripple".to_string()),
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            producer_acks: self.producer_acks.unwrap_or_else(|| "all".to_string()),
            compression: self.compression.unwrap_or_else(|| "none".to_string()),
            partitions: self.partitions.unwrap_or(1),
            replication: self.replication.unwrap_or(1),
            redelivery: Redelivery {
                max_redeliveries: self.max_redeliveries.unwrap_or(DEFAULT_MAX_REDELIVERIES),
                backoff: self.redelivery_backoff.unwrap_or_else(|| {
                    RetryPolicy::builder()
                        .initial_delay(Duration::from_millis(500))
                        .max_delay(Duration::from_secs(30))
                        .build()
                }),
            },
            connect_policy: self.connect_policy.unwrap_or_default(),
            producer: Mutex::new(None),
            closed,
        })
    }

    /// [`build`](Self::build) then [`RedpandaEventBus::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if configuration is
    /// invalid or the broker stays unreachable.
    pub async fn connect(self) -> Result<RedpandaEventBus, EventBusError> {
        let bus = self.build()?;
        bus.connect().await?;
        Ok(bus)
    }
}
