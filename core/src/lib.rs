//! # Ripple Core
//!
//! Contracts for the event-driven consistency layer shared by the content,
//! search and media services.
//!
//! Services never share memory or a transaction boundary. They stay
//! eventually consistent by exchanging [`DomainEvent`](event::DomainEvent)s
//! over an [`EventBus`](event_bus::EventBus) and by keeping their read-through
//! caches coherent with version-partitioned keys.
//!
//! ## Modules
//!
//! - [`event`]: the `content.created` / `content.deleted` event and its JSON wire format
//! - [`topic`]: dot-separated routing keys and topic-exchange binding patterns
//! - [`event_bus`]: publish/subscribe contract with explicit acknowledgement
//! - [`handler`]: idempotent consumer contract, error taxonomy and handler registry
//! - [`cache`]: shared cache-store primitives (get/set/delete/atomic increments)
//! - [`keys`]: the three cache-key grammars (versioned entries, direct items, rate buckets)
//! - [`store`]: authoritative-store and object-storage collaborator interfaces
//! - [`environment`]: injectable clock
//!
//! ## Control flow
//!
//! ```text
//!  write ──► authoritative store (commit)
//!              │
//!              ├──► publish content.* ──► bus ──► consumer (search) ──► upsert / delete-if-exists
//!              │                              └─► consumer (media)  ──► delete listed blobs
//!              │
//!              └──► bump <family>:version   (stale versioned entries become unreachable)
//! ```

pub use chrono::{DateTime, Utc};

pub mod cache;
pub mod event;
pub mod event_bus;
pub mod handler;
pub mod keys;
pub mod store;
pub mod topic;

/// Environment abstractions injected into components.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Producers stamp `occurredAt` with it and the in-memory cache store
    /// uses it to age out entries, so tests can move time deterministically.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
