//! Graceful shutdown coordination.
//!
//! Shutdown runs in a fixed order:
//!
//! 1. the shared [`ShutdownSignal`] flips; consumer loops stop reading new
//!    deliveries but finish the one in flight
//! 2. consumer tasks are awaited, bounded by the grace period; stragglers
//!    are aborted
//! 3. registered [`ShutdownHandler`]s run one after another in registration
//!    order (typically: close the event bus, then release the cache store)
//!
//! ```rust,no_run
//! use ripple_runtime::shutdown::{ShutdownCoordinator, wait_for_signal};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
//! let signal = coordinator.signal();
//! // hand `signal` to consumers, register their handles and cleanup steps
//! wait_for_signal().await;
//! let _ = coordinator.shutdown().await;
//! # drop(signal);
//! # }
//! ```

use async_trait::async_trait;
use ripple_core::event_bus::EventBus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Observer side of the shutdown flag. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// True once shutdown has started.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves when shutdown starts (immediately if it already has).
    ///
    /// A dropped coordinator counts as shutdown.
    pub async fn triggered(&mut self) {
        let _ = self.receiver.wait_for(|triggered| *triggered).await;
    }
}

/// A cleanup step run after consumers have stopped.
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    /// Component name for logging.
    fn name(&self) -> &str;

    /// Release the component.
    ///
    /// # Errors
    ///
    /// Returns a description of what could not be released.
    async fn shutdown(&self) -> Result<(), String>;
}

/// Closes an event bus connection.
pub struct EventBusShutdown {
    bus: Arc<dyn EventBus>,
}

impl EventBusShutdown {
    /// Wrap `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ShutdownHandler for EventBusShutdown {
    fn name(&self) -> &str {
        "event-bus"
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.bus.close().await.map_err(|e| e.to_string())
    }
}

/// Shutdown finished with failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Shutdown completed with {} failure(s): {}", failures.len(), failures.join("; "))]
pub struct ShutdownError {
    /// One entry per component that failed or timed out.
    pub failures: Vec<String>,
}

/// Owns the shutdown flag, the consumer tasks and the cleanup steps.
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
    handlers: Vec<Arc<dyn ShutdownHandler>>,
    grace: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator that waits at most `grace` for each phase.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender,
            tasks: Vec::new(),
            handlers: Vec::new(),
            grace,
        }
    }

    /// A new observer of the shutdown flag.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Track a background task that must drain before cleanup runs.
    pub fn track(&mut self, name: impl Into<String>, task: JoinHandle<()>) {
        self.tasks.push((name.into(), task));
    }

    /// Append a cleanup step.
    pub fn register(&mut self, handler: Arc<dyn ShutdownHandler>) {
        info!(component = handler.name(), "Registered shutdown handler");
        self.handlers.push(handler);
    }

    /// Number of tracked tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Run the shutdown sequence.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] listing every task that had to be aborted
    /// or panicked and every handler that failed or timed out. All steps run
    /// regardless.
    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        info!(
            tasks = self.tasks.len(),
            handlers = self.handlers.len(),
            grace_ms = u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX),
            "Initiating graceful shutdown"
        );
        self.sender.send_replace(true);

        let mut failures = Vec::new();

        for (name, mut task) in self.tasks {
            match tokio::time::timeout(self.grace, &mut task).await {
                Ok(Ok(())) => info!(task = %name, "Task drained"),
                Ok(Err(join_error)) => {
                    error!(task = %name, error = %join_error, "Task ended abnormally");
                    failures.push(format!("{name}: {join_error}"));
                }
                Err(_) => {
                    warn!(task = %name, "Task did not drain in time, aborting");
                    task.abort();
                    failures.push(format!("{name}: aborted after {:?}", self.grace));
                }
            }
        }

        for handler in &self.handlers {
            let name = handler.name();
            match tokio::time::timeout(self.grace, handler.shutdown()).await {
                Ok(Ok(())) => info!(component = name, "Component shut down"),
                Ok(Err(reason)) => {
                    error!(component = name, error = %reason, "Component shutdown failed");
                    failures.push(format!("{name}: {reason}"));
                }
                Err(_) => {
                    error!(component = name, "Component shutdown timed out");
                    failures.push(format!("{name}: timeout after {:?}", self.grace));
                }
            }
        }

        if failures.is_empty() {
            info!("Shutdown complete");
            Ok(())
        } else {
            Err(ShutdownError { failures })
        }
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(error) => warn!(error = %error, "SIGTERM handler unavailable, waiting for Ctrl+C only"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(error) => error!(error = %error, "Failed to listen for Ctrl+C, shutting down"),
    }
}
