//! Event consumers: the handler contract, failure taxonomy and registry.
//!
//! Handlers must be idempotent. The bus delivers at least once, so the same
//! event can arrive again after a crash, a requeue or a broker hiccup; a
//! second application must leave the consumer's state exactly as the first.
//!
//! Failures come in two flavours:
//!
//! - [`HandlerError::Transient`]: a dependency was unavailable. The delivery
//!   is requeued and retried.
//! - [`HandlerError::Permanent`]: retrying cannot help (bad payload, invalid
//!   data). The delivery is acknowledged and logged so it does not poison the
//!   subscription.

use crate::event::{DomainEvent, EventError};
use crate::store::StoreError;
use crate::topic::{TopicError, TopicPattern};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Why a handler could not apply an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Retry later.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Never retry.
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// True for [`HandlerError::Transient`].
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<EventError> for HandlerError {
    fn from(error: EventError) -> Self {
        Self::Permanent(error.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(error: StoreError) -> Self {
        if error.is_transient() {
            Self::Transient(error.to_string())
        } else {
            Self::Permanent(error.to_string())
        }
    }
}

/// A subscriber-side reaction to domain events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &str;

    /// Apply the event. Must be idempotent.
    ///
    /// # Errors
    ///
    /// See [`HandlerError`] for how each variant is treated.
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError>;
}

/// What the consumer loop should do with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded.
    Handled,
    /// Transient failure; requeue.
    Retry(String),
    /// Malformed payload or permanent failure; acknowledge and drop.
    Discard(String),
}

impl Disposition {
    /// True if the delivery should be acknowledged.
    #[must_use]
    pub const fn acknowledges(&self) -> bool {
        !matches!(self, Self::Retry(_))
    }
}

/// Decode one delivery and run it through `handler`.
///
/// Never fails: every outcome maps onto a [`Disposition`].
pub async fn dispatch(handler: &dyn EventHandler, routing_key: &str, payload: &[u8]) -> Disposition {
    let event = match DomainEvent::decode_delivery(routing_key, payload) {
        Ok(event) => event,
        Err(error) => return Disposition::Discard(error.to_string()),
    };

    match handler.handle(&event).await {
        Ok(()) => Disposition::Handled,
        Err(HandlerError::Transient(reason)) => Disposition::Retry(reason),
        Err(HandlerError::Permanent(reason)) => Disposition::Discard(reason),
    }
}

/// Errors raised while building a [`HandlerRegistry`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Two handlers were bound to the same pattern.
    #[error("A handler is already registered for '{0}'")]
    Duplicate(String),

    /// The binding pattern did not parse.
    #[error(transparent)]
    InvalidPattern(#[from] TopicError),
}

/// Explicit pattern-to-handler table, built once at startup.
///
/// One consumer loop is started per entry.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    routes: BTreeMap<String, (TopicPattern, Arc<dyn EventHandler>)>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] for an invalid or already bound pattern.
    pub fn register(
        &mut self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), RegistryError> {
        let parsed = TopicPattern::parse(pattern)?;
        if self.routes.contains_key(pattern) {
            return Err(RegistryError::Duplicate(pattern.to_string()));
        }
        self.routes.insert(pattern.to_string(), (parsed, handler));
        Ok(())
    }

    /// Builder form of [`HandlerRegistry::register`].
    ///
    /// # Errors
    ///
    /// Same as [`HandlerRegistry::register`].
    pub fn with(mut self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<Self, RegistryError> {
        self.register(pattern, handler)?;
        Ok(self)
    }

    /// Registered patterns, sorted.
    #[must_use]
    pub fn patterns(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    /// Handler bound to exactly `pattern`.
    #[must_use]
    pub fn handler(&self, pattern: &str) -> Option<Arc<dyn EventHandler>> {
        self.routes.get(pattern).map(|(_, handler)| handler.clone())
    }

    /// All bindings.
    pub fn routes(&self) -> impl Iterator<Item = (&TopicPattern, &Arc<dyn EventHandler>)> {
        self.routes.values().map(|(pattern, handler)| (pattern, handler))
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.routes.iter().map(|(pattern, (_, handler))| (pattern, handler.name())))
            .finish()
    }
}
