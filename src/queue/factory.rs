//! Queue backend factory

use std::sync::Arc;

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::runtime::Runtime;

use super::backend::QueueBackend;
use super::memory_backend::{MemoryQueueBackend, MemoryQueueConfig};
use super::redis_backend::RedisQueueBackend;

/// Create a queue backend from configuration and register it under `host`.
///
/// The `driver` setting is matched case-insensitively:
/// - `"memory"`: a [`MemoryQueueBackend`] bounded by `pool_num` (0 = unbounded)
/// - `"redis"`: a [`RedisQueueBackend`], connected and verified with PING
///
/// An existing backend for the same host is replaced; the caller that
/// started it remains responsible for closing it.
///
/// # Errors
///
/// `QueueError::Configuration` for an unknown driver and
/// `QueueError::BackendUnavailable` when Redis cannot be reached.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = Runtime::new();
/// let queue = setup_queue(&settings.queue, "default", &runtime).await?;
/// queue.register("email", handler_fn(|msg| async move { send(msg).await }));
/// ```
pub async fn setup_queue(
    config: &QueueConfig,
    host: &str,
    runtime: &Runtime,
) -> Result<Arc<dyn QueueBackend>> {
    let driver = config.driver.trim().to_lowercase();

    let backend: Arc<dyn QueueBackend> = match driver.as_str() {
        "memory" => {
            tracing::info!(
                backend = "memory",
                host = %host,
                pool_num = config.pool_num,
                "Creating memory queue backend"
            );
            Arc::new(MemoryQueueBackend::new(MemoryQueueConfig::from_settings(config)))
        }
        "redis" => {
            tracing::info!(
                backend = "redis",
                host = %host,
                addr = %config.redis_addr(),
                group = %config.consumer_group,
                "Creating Redis queue backend"
            );
            Arc::new(RedisQueueBackend::connect(config).await?)
        }
        other => {
            return Err(QueueError::Configuration(format!(
                "unknown queue driver {:?}, expected \"memory\" or \"redis\"",
                other
            )));
        }
    };

    if runtime.set_queue(host, backend.clone()).is_some() {
        tracing::warn!(host = %host, "Replaced existing queue backend for host");
    }

    Ok(backend)
}

/// Remove the backend registered under `host` and close it.
pub async fn close_queue(runtime: &Runtime, host: &str) -> Result<()> {
    match runtime.remove_queue(host) {
        Some(backend) => {
            backend.close().await?;
            tracing::info!(host = %host, backend = backend.name(), "Queue backend closed");
            Ok(())
        }
        None => {
            tracing::debug!(host = %host, "No queue backend registered for host");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Message, Values};

    #[tokio::test]
    async fn test_memory_driver_is_registered() {
        let runtime = Runtime::new();
        let config = QueueConfig {
            driver: "Memory".to_string(),
            ..Default::default()
        };

        let backend = setup_queue(&config, "default", &runtime).await.unwrap();
        assert_eq!(backend.name(), "memory");

        let registered = runtime.queue("default").unwrap();
        assert!(Arc::ptr_eq(&backend, &registered));
    }

    #[tokio::test]
    async fn test_unknown_driver_is_rejected() {
        let runtime = Runtime::new();
        let config = QueueConfig {
            driver: "kafka".to_string(),
            ..Default::default()
        };

        let result = setup_queue(&config, "default", &runtime).await;
        assert!(matches!(result, Err(QueueError::Configuration(_))));
        assert!(runtime.queue("default").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_unavailable() {
        let runtime = Runtime::new();
        let config = QueueConfig {
            driver: "redis".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_ms: 200,
            ..Default::default()
        };

        let result = setup_queue(&config, "default", &runtime).await;
        assert!(matches!(result, Err(QueueError::BackendUnavailable(_))));
        assert!(runtime.queue("default").is_none());
    }

    #[tokio::test]
    async fn test_close_queue_removes_and_closes() {
        let runtime = Runtime::new();
        let backend = setup_queue(&QueueConfig::default(), "tenant-a", &runtime)
            .await
            .unwrap();

        close_queue(&runtime, "tenant-a").await.unwrap();
        assert!(runtime.queue("tenant-a").is_none());

        let result = backend.append(Message::new("email", Values::new())).await;
        assert!(matches!(result, Err(QueueError::Closed)));

        // Unknown host is a no-op
        close_queue(&runtime, "tenant-a").await.unwrap();
    }
}
