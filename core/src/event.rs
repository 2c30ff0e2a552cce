//! Domain events and their JSON wire format.
//!
//! A [`DomainEvent`] is created the moment an authoritative write commits and
//! is immutable from then on. It is not persisted by the bus: durability, if
//! any, is the broker's concern.
//!
//! # Wire format
//!
//! UTF-8 JSON object. The envelope fields are fixed; kind-specific fields sit
//! beside them in the same object:
//!
//! ```json
//! {
//!   "kind": "content.deleted",
//!   "contentId": "p1",
//!   "actorId": "u1",
//!   "mediaIds": ["m1", "m2"],
//!   "occurredAt": "2025-01-01T00:00:00Z"
//! }
//! ```
//!
//! Unknown fields are kept in [`DomainEvent::payload`] so newer producers can
//! add fields without breaking older consumers. Anything that does not parse
//! is rejected with [`EventError`]; consumers treat that as a permanent
//! failure.

use crate::topic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Payload field carrying the text body of created content.
pub const FIELD_CONTENT: &str = "content";

/// Payload field carrying the explicit list of media ids owned by the content.
pub const FIELD_MEDIA_IDS: &str = "mediaIds";

/// Envelope field names; payload entries with these names are discarded.
const RESERVED_FIELDS: [&str; 4] = ["kind", "contentId", "actorId", "occurredAt"];

/// Errors raised while encoding or decoding events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Payload is not a well-formed event (bad JSON, missing field, unknown kind).
    #[error("Malformed event payload: {0}")]
    Malformed(String),

    /// Delivered under a routing key that does not match the event kind.
    #[error("Event kind '{kind}' delivered under routing key '{routing_key}'")]
    RoutingMismatch {
        /// Kind declared inside the payload
        kind: EventKind,
        /// Routing key the broker delivered it under
        routing_key: String,
    },

    /// A kind-specific field has the wrong shape.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What was wrong
        reason: String,
    },

    /// Serialization failed.
    #[error("Failed to encode event: {0}")]
    Encode(String),
}

/// The two canonical event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Content was committed to the owning service's store.
    #[serde(rename = "content.created")]
    ContentCreated,
    /// Content was removed from the owning service's store.
    #[serde(rename = "content.deleted")]
    ContentDeleted,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 2] = [Self::ContentCreated, Self::ContentDeleted];

    /// Routing key the event is published under.
    #[must_use]
    pub const fn topic(self) -> &'static str {
        match self {
            Self::ContentCreated => topic::CONTENT_CREATED,
            Self::ContentDeleted => topic::CONTENT_DELETED,
        }
    }

    /// Reverse of [`EventKind::topic`].
    #[must_use]
    pub fn from_topic(routing_key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.topic() == routing_key)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

/// A fact about content that other services react to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    kind: EventKind,
    content_id: String,
    actor_id: String,
    occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl DomainEvent {
    /// Build an event. Payload entries that collide with envelope fields are dropped.
    #[must_use]
    pub fn new(
        kind: EventKind,
        content_id: impl Into<String>,
        actor_id: impl Into<String>,
        mut payload: Map<String, Value>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        for reserved in RESERVED_FIELDS {
            payload.remove(reserved);
        }
        Self {
            kind,
            content_id: content_id.into(),
            actor_id: actor_id.into(),
            occurred_at,
            payload,
        }
    }

    /// `content.created` with the body and attached media ids.
    #[must_use]
    pub fn content_created(
        content_id: impl Into<String>,
        actor_id: impl Into<String>,
        content: impl Into<String>,
        media_ids: &[String],
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert(FIELD_CONTENT.to_string(), Value::String(content.into()));
        payload.insert(FIELD_MEDIA_IDS.to_string(), media_ids_value(media_ids));
        Self::new(EventKind::ContentCreated, content_id, actor_id, payload, occurred_at)
    }

    /// `content.deleted` carrying the media ids consumers must clean up.
    #[must_use]
    pub fn content_deleted(
        content_id: impl Into<String>,
        actor_id: impl Into<String>,
        media_ids: &[String],
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert(FIELD_MEDIA_IDS.to_string(), media_ids_value(media_ids));
        Self::new(EventKind::ContentDeleted, content_id, actor_id, payload, occurred_at)
    }

    /// Event kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// Id of the content the event is about.
    #[must_use]
    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    /// Actor that performed the write.
    #[must_use]
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// When the authoritative write committed.
    #[must_use]
    pub const fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Kind-specific and unknown fields.
    #[must_use]
    pub const fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Text body (`content` field), if present.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.payload.get(FIELD_CONTENT).and_then(Value::as_str)
    }

    /// The explicit media id list. A missing field or `null` means no media.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidField`] if `mediaIds` is not an array of strings.
    pub fn media_ids(&self) -> Result<Vec<String>, EventError> {
        match self.payload.get(FIELD_MEDIA_IDS) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| EventError::InvalidField {
                        field: FIELD_MEDIA_IDS,
                        reason: format!("expected string id, found {item}"),
                    })
                })
                .collect(),
            Some(other) => Err(EventError::InvalidField {
                field: FIELD_MEDIA_IDS,
                reason: format!("expected array, found {other}"),
            }),
        }
    }

    /// Serialize to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Encode(e.to_string()))
    }

    /// Parse the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] if the bytes are not a valid event
    /// or an id field is blank.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        let event: Self =
            serde_json::from_slice(bytes).map_err(|e| EventError::Malformed(e.to_string()))?;

        if event.content_id.trim().is_empty() {
            return Err(EventError::Malformed("contentId is blank".to_string()));
        }
        if event.actor_id.trim().is_empty() {
            return Err(EventError::Malformed("actorId is blank".to_string()));
        }
        Ok(event)
    }

    /// Parse and check that the event belongs on the routing key it arrived under.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] or [`EventError::RoutingMismatch`].
    pub fn decode_delivery(routing_key: &str, bytes: &[u8]) -> Result<Self, EventError> {
        let event = Self::decode(bytes)?;
        if event.kind.topic() != routing_key {
            return Err(EventError::RoutingMismatch {
                kind: event.kind,
                routing_key: routing_key.to_string(),
            });
        }
        Ok(event)
    }
}

fn media_ids_value(media_ids: &[String]) -> Value {
    Value::Array(media_ids.iter().cloned().map(Value::String).collect())
}
