//! Node configuration.
//!
//! Loaded from environment variables with defaults for local development.
//! The binary loads a `.env` file first, so anything here can also live
//! there.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `RIPPLE_SERVICE` | required: `content`, `search` or `media` |
//! | `RIPPLE_BROKERS` | `localhost:9092` |
//! | `RIPPLE_EXCHANGE` | `social_events` |
//! | `RIPPLE_MAX_REDELIVERIES` | `5` |
//! | `RIPPLE_BROKER_TIMEOUT_MS` | `5000` |
//! | `REDIS_URL` | `redis://localhost:6379` |
//! | `RIPPLE_CACHE_TIMEOUT_MS` | `250` |
//! | `RIPPLE_LIST_TTL_SECS` | `300` |
//! | `RIPPLE_ITEM_TTL_SECS` | `3600` |
//! | `RIPPLE_SEARCH_TTL_SECS` | `120` |
//! | `RIPPLE_SHUTDOWN_TIMEOUT_SECS` | `30` |
//! | `METRICS_ADDR` | unset (no exporter) |

use ripple_redpanda::{DEFAULT_EXCHANGE, DEFAULT_MAX_REDELIVERIES};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable is set but unusable.
    #[error("Invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// What was wrong with it
        reason: String,
    },
}

/// Which service this node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// Owns content; produces events.
    Content,
    /// Maintains the search read model.
    Search,
    /// Owns media; cleans up after deleted content.
    Media,
}

impl ServiceRole {
    /// Name used in logs and consumer group ids.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Search => "search",
            Self::Media => "media",
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "content" => Ok(Self::Content),
            "search" => Ok(Self::Search),
            "media" => Ok(Self::Media),
            other => Err(format!("unknown service role '{other}' (expected content, search or media)")),
        }
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bootstrap servers, comma-separated.
    pub brokers: String,
    /// Topic-exchange name shared by all services.
    pub exchange: String,
    /// Redeliveries of a requeued delivery before it is dropped.
    pub max_redeliveries: u32,
    /// Publish and admin timeout.
    pub timeout: Duration,
}

/// Time-to-live of each cached read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTtls {
    /// Versioned listing pages.
    pub list: Duration,
    /// Single items under direct keys.
    pub item: Duration,
    /// Versioned search results.
    pub search: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(300),
            item: Duration::from_secs(3600),
            search: Duration::from_secs(120),
        }
    }
}

/// Shared cache store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis connection URL.
    pub url: String,
    /// Timeout of a single cache call; beyond it the cache is treated as down.
    pub op_timeout: Duration,
    /// Entry lifetimes.
    pub ttls: CacheTtls,
}

/// Everything a node needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Service this node runs.
    pub role: ServiceRole,
    /// Event bus.
    pub broker: BrokerConfig,
    /// Cache store.
    pub cache: CacheConfig,
    /// Bound on waiting for in-flight handlers at shutdown.
    pub shutdown_timeout: Duration,
    /// Prometheus listener, if metrics are exported.
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is missing, unparseable or out
    /// of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load through an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        let role = vars
            .get("RIPPLE_SERVICE")
            .ok_or(ConfigError::Missing("RIPPLE_SERVICE"))?
            .parse()
            .map_err(|reason| ConfigError::Invalid {
                name: "RIPPLE_SERVICE",
                reason,
            })?;

        let config = Self {
            role,
            broker: BrokerConfig {
                brokers: vars.get("RIPPLE_BROKERS").unwrap_or_else(|| "localhost:9092".to_string()),
                exchange: vars.get("RIPPLE_EXCHANGE").unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
                max_redeliveries: vars.parse("RIPPLE_MAX_REDELIVERIES", DEFAULT_MAX_REDELIVERIES)?,
                timeout: Duration::from_millis(vars.parse("RIPPLE_BROKER_TIMEOUT_MS", 5000)?),
            },
            cache: CacheConfig {
                url: vars.get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
                op_timeout: Duration::from_millis(vars.parse("RIPPLE_CACHE_TIMEOUT_MS", 250)?),
                ttls: CacheTtls {
                    list: Duration::from_secs(vars.parse("RIPPLE_LIST_TTL_SECS", 300)?),
                    item: Duration::from_secs(vars.parse("RIPPLE_ITEM_TTL_SECS", 3600)?),
                    search: Duration::from_secs(vars.parse("RIPPLE_SEARCH_TTL_SECS", 120)?),
                },
            },
            shutdown_timeout: Duration::from_secs(vars.parse("RIPPLE_SHUTDOWN_TIMEOUT_SECS", 30)?),
            metrics_addr: vars
                .get("METRICS_ADDR")
                .map(|raw| {
                    raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                        name: "METRICS_ADDR",
                        reason: e.to_string(),
                    })
                })
                .transpose()?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("RIPPLE_BROKER_TIMEOUT_MS", self.broker.timeout),
            ("RIPPLE_CACHE_TIMEOUT_MS", self.cache.op_timeout),
            ("RIPPLE_LIST_TTL_SECS", self.cache.ttls.list),
            ("RIPPLE_ITEM_TTL_SECS", self.cache.ttls.item),
            ("RIPPLE_SEARCH_TTL_SECS", self.cache.ttls.search),
            ("RIPPLE_SHUTDOWN_TIMEOUT_SECS", self.shutdown_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.broker.brokers.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "RIPPLE_BROKERS",
                reason: "is empty".to_string(),
            });
        }
        if self.broker.exchange.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "RIPPLE_EXCHANGE",
                reason: "is empty".to_string(),
            });
        }
        Ok(())
    }
}

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T::Err: fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: format!("'{raw}': {e}"),
            }),
        }
    }
}
