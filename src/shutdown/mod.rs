//! Graceful shutdown handling for the task queue service.
//!
//! This module provides coordinated shutdown that:
//! 1. Stops every registered queue backend, letting each drain within its own bound
//! 2. Closes the backends and removes them from the runtime

use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::timeout;

use crate::runtime::Runtime;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for all backends to stop (default: 10 seconds)
    pub stop_timeout: Duration,
    /// Time allowed for closing backends (default: 5 seconds)
    pub close_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Handles graceful shutdown of the queue backends in a runtime
pub struct GracefulShutdown {
    runtime: Runtime,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    /// Create a new graceful shutdown handler
    pub fn new(runtime: Runtime) -> Self {
        Self::with_config(runtime, ShutdownConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(runtime: Runtime, config: ShutdownConfig) -> Self {
        Self { runtime, config }
    }

    /// Execute graceful shutdown sequence
    ///
    /// Returns a ShutdownResult with details about the shutdown process
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(backends = self.runtime.len())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult {
            backends: self.runtime.len(),
            ..Default::default()
        };

        // Phase 1: Stop consumers
        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping queue backends");
        result.backends_stopped = self.stop_backends().await;

        // Phase 2: Release resources
        tracing::info!("Phase 2: Closing queue backends");
        match timeout(self.config.close_timeout, self.runtime.close_all()).await {
            Ok(failures) => result.close_failures = failures.len(),
            Err(_) => {
                tracing::warn!(
                    remaining = self.runtime.len(),
                    "Timed out closing queue backends"
                );
                result.close_failures = self.runtime.len();
            }
        }

        result.duration = start.elapsed();
        result.success = result.backends_stopped == result.backends && result.close_failures == 0;

        tracing::info!(
            backends = result.backends,
            backends_stopped = result.backends_stopped,
            close_failures = result.close_failures,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    /// Shut down every backend concurrently, returning how many finished in time
    async fn stop_backends(&self) -> usize {
        let mut futures = FuturesUnordered::new();

        for host in self.runtime.hosts() {
            let Some(backend) = self.runtime.queue(&host) else {
                continue;
            };
            futures.push(async move {
                backend.shutdown().await;
                tracing::debug!(host = %host, backend = backend.name(), "Queue backend stopped");
            });
        }

        let mut stopped = 0;
        let stop_future = async {
            while futures.next().await.is_some() {
                stopped += 1;
            }
        };

        if timeout(self.config.stop_timeout, stop_future).await.is_err() {
            tracing::warn!(
                stopped = stopped,
                "Queue backend stop timeout, closing remaining backends anyway"
            );
        }

        stopped
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether every backend stopped and closed cleanly
    pub success: bool,
    /// Number of backends registered when shutdown started
    pub backends: usize,
    /// Number of backends that stopped within the timeout
    pub backends_stopped: usize,
    /// Number of backends that failed to close
    pub close_failures: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}
