//! Node wiring: one process runs one service role.
//!
//! Construction is explicit. The binary connects the bus and the cache
//! store, wraps them in [`Shared`], and [`RippleNode::start`] builds the
//! role's service and starts its consumers. Nothing is a process-wide
//! singleton, so tests run several nodes side by side on in-memory
//! infrastructure.
//!
//! | Role | Produces | Consumes |
//! |------|----------|----------|
//! | content | `content.created`, `content.deleted` | nothing |
//! | search | nothing | `content.*` ([`SearchIndexer`]) |
//! | media | nothing | `content.deleted` ([`MediaJanitor`]) |

use crate::admission::AdmissionGate;
use crate::config::{CacheConfig, CacheTtls, ServiceRole};
use crate::content::ContentService;
use crate::media::{MediaJanitor, MediaService};
use crate::search::{SearchIndexer, SearchService};
use ripple_core::cache::CacheStore;
use ripple_core::environment::Clock;
use ripple_core::event_bus::EventBus;
use ripple_core::handler::{EventHandler, HandlerRegistry, RegistryError};
use ripple_core::store::{ContentStore, MediaStore, ObjectStorage, SearchIndex};
use ripple_core::topic;
use ripple_runtime::shutdown::{EventBusShutdown, ShutdownError};
use ripple_runtime::{
    DomainEventProducer, EventConsumer, RateAdmissionController, RetryPolicy, ShutdownCoordinator,
    VersionedCache,
};
use ripple_testing::{InMemoryContentStore, InMemoryMediaStore, InMemoryObjectStorage, InMemorySearchIndex};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Binding the search indexer uses.
pub const SEARCH_BINDING: &str = "content.*";

/// Node startup and shutdown errors.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Handler bindings are inconsistent.
    #[error("Handler registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Some component did not shut down cleanly.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// Infrastructure every role shares.
#[derive(Clone)]
pub struct Shared {
    /// Event bus.
    pub bus: Arc<dyn EventBus>,
    /// Versioned cache over the shared cache store.
    pub cache: VersionedCache,
    /// Rate admission over the same store.
    pub limiter: RateAdmissionController,
    /// Time source for event stamps.
    pub clock: Arc<dyn Clock>,
    /// Cache entry lifetimes.
    pub ttls: CacheTtls,
}

impl Shared {
    /// Bundle connected infrastructure.
    #[must_use]
    pub fn new(
        bus: Arc<dyn EventBus>,
        cache_store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            bus,
            cache: VersionedCache::with_timeout(Arc::clone(&cache_store), cache.op_timeout),
            limiter: RateAdmissionController::with_timeout(cache_store, cache.op_timeout),
            clock,
            ttls: cache.ttls,
        }
    }
}

/// Content service over `store`, producing onto the shared bus.
#[must_use]
pub fn content_service<S: ContentStore>(shared: &Shared, store: S) -> ContentService<S> {
    let producer = DomainEventProducer::new(
        Arc::clone(&shared.bus),
        shared.cache.clone(),
        Arc::clone(&shared.clock),
        ContentService::<S>::invalidation(),
    );
    ContentService::new(
        store,
        shared.cache.clone(),
        shared.limiter.clone(),
        producer,
        Arc::clone(&shared.clock),
        shared.ttls,
    )
}

/// Bindings of the search role.
///
/// # Errors
///
/// Returns [`RegistryError`] if a binding is invalid.
pub fn search_handlers<I: SearchIndex + 'static>(
    shared: &Shared,
    index: Arc<I>,
) -> Result<HandlerRegistry, RegistryError> {
    let indexer: Arc<dyn EventHandler> = Arc::new(SearchIndexer::new(index, shared.cache.clone()));
    HandlerRegistry::new().with(SEARCH_BINDING, indexer)
}

/// Bindings of the media role.
///
/// # Errors
///
/// Returns [`RegistryError`] if a binding is invalid.
pub fn media_handlers<M, O>(media: Arc<M>, storage: Arc<O>) -> Result<HandlerRegistry, RegistryError>
where
    M: MediaStore + 'static,
    O: ObjectStorage + 'static,
{
    let janitor: Arc<dyn EventHandler> = Arc::new(MediaJanitor::new(media, storage));
    HandlerRegistry::new().with(topic::CONTENT_DELETED, janitor)
}

/// Start one consumer per binding and hand each to `coordinator`.
///
/// Returns the number of consumers started.
pub fn start_consumers(
    registry: &HandlerRegistry,
    bus: &Arc<dyn EventBus>,
    coordinator: &mut ShutdownCoordinator,
) -> usize {
    let consumers = EventConsumer::from_registry(registry, bus, &coordinator.signal(), &RetryPolicy::default());
    let started = consumers.len();

    for consumer in consumers {
        let name = consumer.name().to_string();
        let pattern = consumer.pattern().to_string();
        let task = consumer.spawn();
        let label = name.clone();
        coordinator.track(
            name,
            tokio::spawn(async move {
                match task.await {
                    Ok(stats) => tracing::info!(
                        consumer = %label,
                        pattern = %pattern,
                        handled = stats.handled,
                        retried = stats.retried,
                        discarded = stats.discarded,
                        "Consumer stopped"
                    ),
                    Err(error) => tracing::error!(consumer = %label, error = %error, "Consumer task failed"),
                }
            }),
        );
    }
    started
}

/// Collaborator stores a node runs against.
///
/// In-memory for now; clones share state, so a caller can keep a handle and
/// inspect what the node did.
#[derive(Debug, Clone, Default)]
pub struct Collaborators {
    /// Authoritative content.
    pub content: InMemoryContentStore,
    /// Search read model.
    pub search: Arc<InMemorySearchIndex>,
    /// Media metadata.
    pub media: Arc<InMemoryMediaStore>,
    /// Media blobs.
    pub storage: Arc<InMemoryObjectStorage>,
}

/// The service a node exposes for its role.
pub enum RoleService {
    /// Content role.
    Content(ContentService<InMemoryContentStore>),
    /// Search role.
    Search(SearchService<InMemorySearchIndex>),
    /// Media role.
    Media(MediaService<InMemoryMediaStore, InMemoryObjectStorage>),
}

/// A running node.
pub struct RippleNode {
    role: ServiceRole,
    service: RoleService,
    admission: AdmissionGate,
    coordinator: ShutdownCoordinator,
    consumers: usize,
}

impl RippleNode {
    /// Build the role's service, start its consumers and register the bus
    /// for shutdown. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Registry`] if the role's bindings are invalid.
    pub fn start(
        role: ServiceRole,
        shared: &Shared,
        collaborators: Collaborators,
        shutdown_timeout: Duration,
    ) -> Result<Self, NodeError> {
        let mut coordinator = ShutdownCoordinator::new(shutdown_timeout);

        let (service, consumers) = match role {
            ServiceRole::Content => (RoleService::Content(content_service(shared, collaborators.content)), 0),
            ServiceRole::Search => {
                let registry = search_handlers(shared, Arc::clone(&collaborators.search))?;
                let consumers = start_consumers(&registry, &shared.bus, &mut coordinator);
                let service = SearchService::new(collaborators.search, shared.cache.clone(), &shared.ttls);
                (RoleService::Search(service), consumers)
            }
            ServiceRole::Media => {
                let registry = media_handlers(Arc::clone(&collaborators.media), Arc::clone(&collaborators.storage))?;
                let consumers = start_consumers(&registry, &shared.bus, &mut coordinator);
                let service = MediaService::new(collaborators.media, collaborators.storage, shared.limiter.clone());
                (RoleService::Media(service), consumers)
            }
        };

        coordinator.register(Arc::new(EventBusShutdown::new(Arc::clone(&shared.bus))));
        tracing::info!(role = %role, consumers, "Node started");

        Ok(Self {
            role,
            service,
            admission: AdmissionGate::new(shared.limiter.clone()),
            coordinator,
            consumers,
        })
    }

    /// Role this node runs.
    #[must_use]
    pub const fn role(&self) -> ServiceRole {
        self.role
    }

    /// The role's service.
    #[must_use]
    pub const fn service(&self) -> &RoleService {
        &self.service
    }

    /// Edge admission gate.
    #[must_use]
    pub const fn admission(&self) -> &AdmissionGate {
        &self.admission
    }

    /// Consumers started for this role.
    #[must_use]
    pub const fn consumer_count(&self) -> usize {
        self.consumers
    }

    /// Stop consumers, wait for in-flight handlers, then close the bus.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Shutdown`] if a task overran the timeout or the
    /// bus failed to close.
    pub async fn shutdown(self) -> Result<(), NodeError> {
        tracing::info!(role = %self.role, "Node shutting down");
        self.coordinator.shutdown().await?;
        Ok(())
    }
}
