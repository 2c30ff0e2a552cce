//! # Ripple Runtime
//!
//! The moving parts of the consistency layer, built on the contracts in
//! `ripple-core`.
//!
//! ## Core Components
//!
//! - **[`VersionedCache`]**: read-through cache whose family entries are
//!   invalidated in O(1) by bumping a version counter
//! - **[`RateAdmissionController`]**: fixed-window limiter shared by all
//!   instances through the cache store
//! - **[`DomainEventProducer`]**: publish-then-invalidate after a committed write
//! - **[`EventConsumer`]**: sequential subscribe-dispatch-settle loop with
//!   resubscription and graceful shutdown
//!
//! ## Example
//!
//! ```ignore
//! use ripple_runtime::{DomainEventProducer, Invalidation, VersionedCache};
//!
//! let cache = VersionedCache::new(cache_store.clone());
//! let producer = DomainEventProducer::new(
//!     event_bus.clone(),
//!     cache.clone(),
//!     clock,
//!     Invalidation::none().family(CONTENT_LIST).item(CONTENT),
//! );
//!
//! let record = store.create(new_content).await?;
//! producer.emit_event(&DomainEvent::content_created(...)).await;
//! ```

/// Version-partitioned read-through cache
pub mod cache;

/// Subscribe-dispatch-settle loop
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

/// Publish-then-invalidate after committed writes
pub mod producer;

/// Fixed-window rate admission
pub mod rate_limit;

/// Retry logic with exponential backoff
pub mod retry;

/// Ordered graceful shutdown
pub mod shutdown;

pub use cache::{CacheLookup, VersionedCache};
pub use consumer::{ConsumerStats, EventConsumer};
pub use producer::{DomainEventProducer, EmitReport, Invalidation};
pub use rate_limit::{FailMode, RateAdmissionController, RateDecision, RateLimitPolicy};
pub use retry::{Backoff, RetryPolicy};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};
