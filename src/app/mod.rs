//! Queue bootstrap for the service.
//!
//! A queue that cannot be set up (unknown driver, Redis down) does not stop
//! the process: [`start_queue`] logs the failure and the service keeps
//! running without task queue support.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::queue::{setup_queue, Message, MessageHandler, QueueBackend};
use crate::runtime::Runtime;

/// A started queue backend and the task driving its consumers.
pub struct QueueHandle {
    host: String,
    backend: Arc<dyn QueueBackend>,
    runner: JoinHandle<Result<()>>,
}

impl QueueHandle {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Wait for `run` to return, which happens after the backend is shut down.
    ///
    /// # Errors
    ///
    /// Returns the error `run` returned, or `QueueError::Runner` if the runner
    /// task panicked or was cancelled.
    pub async fn join(self) -> Result<()> {
        match self.runner.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(host = %self.host, error = %e, "Queue runner task failed");
                Err(QueueError::Runner(e.to_string()))
            }
        }
    }
}

/// Set up the backend for `host`, register `consumers` and start consuming.
///
/// Returns `None` when the backend could not be created.
pub async fn start_queue(
    runtime: &Runtime,
    config: &QueueConfig,
    host: &str,
    consumers: Vec<(String, Arc<dyn MessageHandler>)>,
) -> Option<QueueHandle> {
    let backend = match setup_queue(config, host, runtime).await {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(
                host = %host,
                driver = %config.driver,
                error = %e,
                "Queue backend unavailable, continuing without task queue"
            );
            return None;
        }
    };

    for (stream, handler) in consumers {
        backend.register(&stream, handler);
    }

    let runner = {
        let backend = backend.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            let result = backend.run().await;
            if let Err(ref e) = result {
                tracing::error!(host = %host, error = %e, "Queue backend stopped with error");
            }
            result
        })
    };

    tracing::info!(host = %host, backend = backend.name(), "Task queue started");

    Some(QueueHandle {
        host: host.to_string(),
        backend,
        runner,
    })
}

/// Consumer that only logs what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let host = message.prefix();
        tracing::info!(
            stream = %message.stream(),
            message_id = %message.id(),
            error_count = message.error_count(),
            host = host.as_deref().unwrap_or("-"),
            values = %serde_json::Value::Object(message.values()),
            "Received task"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{handler_fn, MemoryQueueBackend, Values};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_queue_delivers() {
        let runtime = Runtime::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let handle = start_queue(
            &runtime,
            &QueueConfig::default(),
            "default",
            vec![(
                "email".to_string(),
                handler_fn(move |_msg: Message| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok(())
                    }
                }),
            )],
        )
        .await
        .expect("memory backend should start");

        handle
            .backend()
            .append(Message::new("email", Values::new()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.backend().shutdown().await;
        handle.join().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_queue_degrades_when_redis_is_down() {
        let runtime = Runtime::new();
        let config = QueueConfig {
            driver: "redis".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_ms: 200,
            ..Default::default()
        };

        let handle = start_queue(
            &runtime,
            &config,
            "default",
            vec![("email".to_string(), Arc::new(LoggingHandler) as Arc<dyn MessageHandler>)],
        )
        .await;

        assert!(handle.is_none());
        assert!(runtime.is_empty());
    }

    #[tokio::test]
    async fn test_join_reports_failed_runner() {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::unbounded());

        let panicked = QueueHandle {
            host: "default".to_string(),
            backend: backend.clone(),
            runner: tokio::spawn(crashing_runner()),
        };
        assert!(matches!(panicked.join().await, Err(QueueError::Runner(_))));

        let runner = tokio::spawn(std::future::pending::<Result<()>>());
        runner.abort();
        let cancelled = QueueHandle {
            host: "default".to_string(),
            backend,
            runner,
        };
        assert!(matches!(cancelled.join().await, Err(QueueError::Runner(_))));
    }

    async fn crashing_runner() -> Result<()> {
        panic!("runner crashed")
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_any_message() {
        let message = Message::new("audit", Values::new());
        message.set_prefix("tenant-a");
        assert!(LoggingHandler.handle(&message).await.is_ok());
    }
}
