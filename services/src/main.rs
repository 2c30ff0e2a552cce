//! Ripple node.
//!
//! Runs one service role against Redpanda and Redis:
//!
//! ```bash
//! RIPPLE_SERVICE=search RIPPLE_BROKERS=localhost:9092 cargo run --bin ripple-node
//! ```
//!
//! Stops on Ctrl+C or SIGTERM: consumers finish their current delivery,
//! then the bus is flushed and closed.

use anyhow::Context;
use ripple_core::environment::SystemClock;
use ripple_redis::RedisCacheStore;
use ripple_redpanda::RedpandaEventBus;
use ripple_runtime::metrics::MetricsServer;
use ripple_runtime::shutdown::wait_for_signal;
use ripple_services::{Collaborators, Config, RippleNode, Shared};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ripple=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Invalid configuration")?;
    tracing::info!(
        role = %config.role,
        brokers = %config.broker.brokers,
        exchange = %config.broker.exchange,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr)
            .start()
            .context("Failed to start metrics exporter")?;
    }

    let bus = RedpandaEventBus::builder()
        .brokers(&config.broker.brokers)
        .exchange(&config.broker.exchange)
        .service(config.role.as_str())
        .timeout(config.broker.timeout)
        .max_redeliveries(config.broker.max_redeliveries)
        .connect()
        .await
        .context("Failed to connect to the event bus")?;

    let cache_store = RedisCacheStore::connect(&config.cache.url)
        .await
        .context("Failed to connect to the cache store")?;

    let shared = Shared::new(Arc::new(bus), Arc::new(cache_store), Arc::new(SystemClock), &config.cache);
    let node = RippleNode::start(config.role, &shared, Collaborators::default(), config.shutdown_timeout)?;
    tracing::info!(role = %node.role(), consumers = node.consumer_count(), "Ripple node running");

    wait_for_signal().await;
    node.shutdown().await?;
    Ok(())
}
