//! Publish/subscribe contract for cross-service events.
//!
//! The bus is a topic exchange: a message published under a routing key is
//! delivered to every live subscription whose [`TopicPattern`] matches it.
//! Delivery is at-least-once. A message stays owned by the bus until the
//! consumer settles it with [`Delivery::ack`] or [`Delivery::requeue`].
//!
//! ```text
//!  publish("content.deleted") ──► exchange ──┬─► subscription "content.*"   ──► search consumer
//!                                            └─► subscription "content.deleted" ──► media consumer
//! ```
//!
//! Nothing is retained for subscriptions that did not exist at publish time,
//! and a message sent while the broker is unreachable is lost. Callers treat
//! publish as best effort and recover through cache TTLs and idempotent
//! handlers.
//!
//! # Implementations
//!
//! - `ripple_testing::InMemoryEventBus`: in-process exchange for tests
//! - `ripple_redpanda::RedpandaEventBus`: Kafka-compatible broker

use crate::topic::TopicPattern;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish to a routing key
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The routing key that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to bind a subscription
    #[error("Subscription failed for pattern '{pattern}': {reason}")]
    SubscriptionFailed {
        /// Binding pattern
        pattern: String,
        /// The reason for failure
        reason: String,
    },

    /// Settling a delivery failed
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),

    /// Routing key or pattern is invalid
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The bus was closed
    #[error("Event bus is closed")]
    Closed,
}

/// How a consumer settled a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Processed (or deliberately discarded); remove from the subscription.
    Ack,
    /// Not processed; deliver again.
    Requeue,
}

/// Transport-specific settlement of one delivery.
///
/// Implemented by each bus; consumers only see [`Delivery`].
pub trait Acknowledger: Send {
    /// Settle the delivery. Called at most once.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::AckFailed`] if the transport rejects the settlement.
    fn settle(self: Box<Self>, outcome: AckOutcome) -> Result<(), EventBusError>;
}

/// One message handed to a subscriber.
pub struct Delivery {
    routing_key: String,
    payload: Vec<u8>,
    attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Wrap a received message. `attempt` starts at 1.
    #[must_use]
    pub fn new(
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        attempt: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload,
            attempt: attempt.max(1),
            acker,
        }
    }

    /// Routing key the message was published under.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Raw message body.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Delivery attempt, 1 for the first delivery.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True if this message was delivered before and requeued.
    #[must_use]
    pub const fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    /// Confirm the message is done with.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::AckFailed`] if the transport rejects it.
    pub fn ack(self) -> Result<(), EventBusError> {
        self.acker.settle(AckOutcome::Ack)
    }

    /// Return the message for another delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::AckFailed`] if the transport rejects it.
    pub fn requeue(self) -> Result<(), EventBusError> {
        self.acker.settle(AckOutcome::Requeue)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries for one subscription.
///
/// Ends when the bus is closed. An `Err` item means the subscription broke;
/// the consumer is expected to resubscribe.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn` so the
/// bus can be shared as `Arc<dyn EventBus>` between producers and consumers.
pub trait EventBus: Send + Sync {
    /// Publish a message under a concrete routing key.
    ///
    /// Completes once the broker has accepted the message. It is not
    /// retained for subscriptions created later.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::InvalidTopic`] for a malformed routing key,
    /// [`EventBusError::PublishFailed`] if the broker rejected the message, or
    /// [`EventBusError::Closed`] after [`EventBus::close`].
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>>;

    /// Open a subscription bound with `pattern`.
    ///
    /// Each call gets its own fan-out copy of matching messages, delivered
    /// one at a time: the next message is not handed out until the previous
    /// one is settled.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the binding cannot be
    /// established.
    fn subscribe(
        &self,
        pattern: TopicPattern,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>>;

    /// Release broker resources. Open delivery streams end.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::TransportError`] if shutdown fails.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder(Arc<Mutex<Vec<AckOutcome>>>);

    impl Acknowledger for Recorder {
        fn settle(self: Box<Self>, outcome: AckOutcome) -> Result<(), EventBusError> {
            self.0.lock().unwrap().push(outcome);
            Ok(())
        }
    }

    #[test]
    fn delivery_settles_through_its_acknowledger() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = Delivery::new("content.created", b"{}".to_vec(), 1, Box::new(Recorder(log.clone())));
        assert!(!first.is_redelivery());
        first.requeue().unwrap();

        let second = Delivery::new("content.created", b"{}".to_vec(), 2, Box::new(Recorder(log.clone())));
        assert!(second.is_redelivery());
        assert_eq!(second.routing_key(), "content.created");
        second.ack().unwrap();

        assert_eq!(*log.lock().unwrap(), vec![AckOutcome::Requeue, AckOutcome::Ack]);
    }

    #[test]
    fn attempt_is_at_least_one() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let delivery = Delivery::new("content.deleted", Vec::new(), 0, Box::new(Recorder(log)));
        assert_eq!(delivery.attempt(), 1);
        assert!(format!("{delivery:?}").contains("content.deleted"));
    }
}
