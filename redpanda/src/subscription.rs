//! Per-subscription pump: broker records in, one settled delivery at a time out.

use ripple_core::event_bus::{AckOutcome, Acknowledger, Delivery, EventBusError};
use ripple_core::topic::TopicPattern;
use ripple_runtime::retry::RetryPolicy;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use tokio::sync::{mpsc, oneshot, watch};

/// Header carrying the routing key next to the record key.
pub const ROUTING_KEY_HEADER: &str = "routing-key";

/// How requeued deliveries come back.
#[derive(Debug, Clone)]
pub(crate) struct Redelivery {
    pub(crate) max_redeliveries: u32,
    pub(crate) backoff: RetryPolicy,
}

/// What to do with a record after its delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Commit the offset.
    Commit,
    /// Hand it out again as this attempt.
    Redeliver(u32),
    /// Out of redeliveries: log and commit.
    GiveUp,
}

/// Decide the next step. `None` means the delivery was dropped unsettled,
/// which counts as a requeue.
pub(crate) fn next_step(outcome: Option<AckOutcome>, attempt: u32, max_redeliveries: u32) -> Step {
    match outcome {
        Some(AckOutcome::Ack) => Step::Commit,
        Some(AckOutcome::Requeue) | None if attempt <= max_redeliveries => {
            Step::Redeliver(attempt.saturating_add(1))
        }
        Some(AckOutcome::Requeue) | None => Step::GiveUp,
    }
}

/// Routing key of a record: the header if present, else the record key.
pub(crate) fn routing_key_of<M: Message>(message: &M) -> Option<String> {
    let from_header = message.headers().and_then(|headers| {
        headers
            .iter()
            .find(|header| header.key == ROUTING_KEY_HEADER)
            .and_then(|header| header.value)
            .and_then(|value| std::str::from_utf8(value).ok())
            .map(str::to_string)
    });

    from_header.or_else(|| {
        message
            .key()
            .and_then(|key| std::str::from_utf8(key).ok())
            .map(str::to_string)
    })
}

struct SettleHandle(oneshot::Sender<AckOutcome>);

impl Acknowledger for SettleHandle {
    fn settle(self: Box<Self>, outcome: AckOutcome) -> Result<(), EventBusError> {
        self.0
            .send(outcome)
            .map_err(|_| EventBusError::AckFailed("subscription ended".to_string()))
    }
}

fn commit(consumer: &StreamConsumer, message: &BorrowedMessage<'_>) {
    if let Err(error) = consumer.commit_message(message, CommitMode::Async) {
        tracing::warn!(
            partition = message.partition(),
            offset = message.offset(),
            error = %error,
            "Failed to commit offset (record may be redelivered)"
        );
    }
}

/// Owns the broker consumer for one subscription.
///
/// Returns when the subscriber drops its stream, the bus is closed or the
/// broker stream ends. Uncommitted records are simply left behind: the
/// consumer group is unique to this subscription and dies with it.
pub(crate) async fn pump(
    consumer: StreamConsumer,
    pattern: TopicPattern,
    group_id: String,
    sender: mpsc::Sender<Result<Delivery, EventBusError>>,
    mut closed: watch::Receiver<bool>,
    redelivery: Redelivery,
) {
    let mut records = consumer.stream();

    loop {
        let next = tokio::select! {
            biased;
            _ = closed.changed() => break,
            next = records.next() => next,
        };

        let message = match next {
            None => break,
            Some(Ok(message)) => message,
            Some(Err(error)) => {
                let error = EventBusError::TransportError(format!("Failed to receive record: {error}"));
                if sender.send(Err(error)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let Some(routing_key) = routing_key_of(&message) else {
            tracing::warn!(
                group = %group_id,
                offset = message.offset(),
                "Record without routing key, skipping"
            );
            commit(&consumer, &message);
            continue;
        };

        if !pattern.matches(&routing_key) {
            commit(&consumer, &message);
            continue;
        }

        let payload = message.payload().unwrap_or_default().to_vec();
        let mut attempt = 1;
        loop {
            let (settle_tx, settle_rx) = oneshot::channel();
            let delivery = Delivery::new(
                routing_key.clone(),
                payload.clone(),
                attempt,
                Box::new(SettleHandle(settle_tx)),
            );
            if sender.send(Ok(delivery)).await.is_err() {
                tracing::debug!(group = %group_id, "Subscriber dropped its stream");
                return;
            }

            match next_step(settle_rx.await.ok(), attempt, redelivery.max_redeliveries) {
                Step::Commit => break,
                Step::GiveUp => {
                    tracing::error!(
                        group = %group_id,
                        routing_key = %routing_key,
                        attempts = attempt,
                        "Dropping record after exhausting redeliveries"
                    );
                    break;
                }
                Step::Redeliver(next) => {
                    let delay = redelivery.backoff.jittered_delay(attempt - 1);
                    tracing::debug!(
                        group = %group_id,
                        routing_key = %routing_key,
                        attempt = next,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Redelivering record"
                    );
                    tokio::select! {
                        biased;
                        _ = closed.changed() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt = next;
                }
            }
        }
        commit(&consumer, &message);
    }

    tracing::debug!(group = %group_id, "Subscription pump exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rdkafka::Timestamp;
    use rdkafka::message::{Header, OwnedHeaders, OwnedMessage};

    fn record(key: Option<&str>, header: Option<&str>) -> OwnedMessage {
        let headers = header.map(|value| {
            OwnedHeaders::new().insert(Header {
                key: ROUTING_KEY_HEADER,
                value: Some(value),
            })
        });
        OwnedMessage::new(
            Some(b"{}".to_vec()),
            key.map(|k| k.as_bytes().to_vec()),
            "social_events".to_string(),
            Timestamp::NotAvailable,
            0,
            7,
            headers,
        )
    }

    #[test]
    fn header_wins_over_record_key() {
        let message = record(Some("content.created"), Some("content.deleted"));
        assert_eq!(routing_key_of(&message).as_deref(), Some("content.deleted"));
    }

    #[test]
    fn record_key_is_the_fallback() {
        assert_eq!(
            routing_key_of(&record(Some("content.created"), None)).as_deref(),
            Some("content.created")
        );
        assert_eq!(routing_key_of(&record(None, None)), None);
    }

    #[test]
    fn ack_commits_and_requeue_redelivers_until_the_bound() {
        assert_eq!(next_step(Some(AckOutcome::Ack), 1, 5), Step::Commit);
        assert_eq!(next_step(Some(AckOutcome::Requeue), 1, 5), Step::Redeliver(2));
        assert_eq!(next_step(Some(AckOutcome::Requeue), 5, 5), Step::Redeliver(6));
        assert_eq!(next_step(Some(AckOutcome::Requeue), 6, 5), Step::GiveUp);
    }

    #[test]
    fn unsettled_delivery_counts_as_requeue() {
        assert_eq!(next_step(None, 1, 5), Step::Redeliver(2));
        assert_eq!(next_step(None, 1, 0), Step::GiveUp);
    }
}
