//! Prometheus metrics for the consistency layer.
//!
//! Counters cover the places where the layer degrades silently:
//! - event publishing (a failed publish never fails the write)
//! - delivery settlement (acked, requeued, discarded)
//! - cache lookups (hits, misses, fail-open reads) and version bumps
//! - rate admission (allowed, denied, store failures)
//!
//! Recording is always on; the values only leave the process when a
//! [`MetricsServer`] is started.
//!
//! # Example
//!
//! ```rust,no_run
//! use ripple_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and serve `/metrics`.
    ///
    /// Must be called from inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed is tolerated with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                let addr = self.addr;
                // ExporterError carries no Debug or Display impl.
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!(addr = %addr, "Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics server started");
                Ok(())
            }
            Err(_) => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
        }
    }

    /// Render current metrics in Prometheus text format, if started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!("ripple_events_published_total", "Events accepted by the broker");
    describe_counter!(
        "ripple_event_publish_failures_total",
        "Events lost because the broker rejected or was unreachable"
    );
    describe_counter!("ripple_deliveries_acked_total", "Deliveries processed and acknowledged");
    describe_counter!("ripple_deliveries_requeued_total", "Deliveries requeued after a transient failure");
    describe_counter!(
        "ripple_deliveries_discarded_total",
        "Deliveries acknowledged without effect (malformed or permanent failure)"
    );
    describe_histogram!("ripple_handler_duration_seconds", "Time spent in event handlers");
    describe_counter!("ripple_cache_hits_total", "Cache lookups served from the cache store");
    describe_counter!("ripple_cache_misses_total", "Cache lookups that fell through to the source");
    describe_counter!(
        "ripple_cache_fail_open_total",
        "Cache operations that failed or timed out and were treated as misses"
    );
    describe_counter!("ripple_cache_version_bumps_total", "Family version increments");
    describe_counter!("ripple_rate_limit_allowed_total", "Requests admitted by a rate limit");
    describe_counter!("ripple_rate_limit_denied_total", "Requests rejected by a rate limit");
    describe_counter!(
        "ripple_rate_limit_store_failures_total",
        "Rate checks decided by the fail mode because the store failed"
    );
}

/// Event publishing.
pub struct EventBusMetrics;

impl EventBusMetrics {
    /// Broker accepted the event.
    pub fn record_publish(topic: &str) {
        counter!("ripple_events_published_total", "topic" => topic.to_string()).increment(1);
    }

    /// Publish failed; the event is lost.
    pub fn record_publish_failure(topic: &str) {
        counter!("ripple_event_publish_failures_total", "topic" => topic.to_string()).increment(1);
    }
}

/// Delivery settlement in the consumption loop.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Handler succeeded and the delivery was acknowledged.
    pub fn record_ack(handler: &str) {
        counter!("ripple_deliveries_acked_total", "handler" => handler.to_string()).increment(1);
    }

    /// Delivery returned for another attempt.
    pub fn record_requeue(handler: &str) {
        counter!("ripple_deliveries_requeued_total", "handler" => handler.to_string()).increment(1);
    }

    /// Delivery acknowledged without effect.
    pub fn record_discard(handler: &str) {
        counter!("ripple_deliveries_discarded_total", "handler" => handler.to_string()).increment(1);
    }

    /// Time the handler took.
    pub fn record_duration(handler: &str, duration: Duration) {
        histogram!("ripple_handler_duration_seconds", "handler" => handler.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Versioned cache coordinator.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Lookup hit.
    pub fn record_hit(family: &str) {
        counter!("ripple_cache_hits_total", "family" => family.to_string()).increment(1);
    }

    /// Lookup miss.
    pub fn record_miss(family: &str) {
        counter!("ripple_cache_misses_total", "family" => family.to_string()).increment(1);
    }

    /// Store failure or timeout absorbed.
    pub fn record_fail_open(family: &str) {
        counter!("ripple_cache_fail_open_total", "family" => family.to_string()).increment(1);
    }

    /// Family version advanced.
    pub fn record_version_bump(family: &str) {
        counter!("ripple_cache_version_bumps_total", "family" => family.to_string()).increment(1);
    }
}

/// Rate admission controller.
pub struct RateLimitMetrics;

impl RateLimitMetrics {
    /// Request admitted.
    pub fn record_allowed(scope: &str) {
        counter!("ripple_rate_limit_allowed_total", "scope" => scope.to_string()).increment(1);
    }

    /// Request rejected.
    pub fn record_denied(scope: &str) {
        counter!("ripple_rate_limit_denied_total", "scope" => scope.to_string()).increment(1);
    }

    /// Store failed; the policy's fail mode decided.
    pub fn record_store_failure(scope: &str) {
        counter!("ripple_rate_limit_store_failures_total", "scope" => scope.to_string()).increment(1);
    }
}
