//! Backend trait for task queues.
//!
//! This module defines the contract shared by the in-process and Redis
//! Streams backends, and the handler trait consumers implement.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{QueueError, Result};

use super::message::Message;

/// Consumer of messages on a stream.
///
/// The message is borrowed for the duration of the call; the backend keeps
/// ownership for retry bookkeeping. Returning an error counts as a failed
/// delivery attempt.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Handler built from an async closure, see [`handler_fn`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self.f)(message.clone()).await
    }
}

/// Wrap an async closure as a handler. The closure receives a snapshot of the message.
///
/// ```rust,ignore
/// backend.register("email", handler_fn(|msg| async move {
///     send_email(msg.values()).await
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}

/// Per-stream statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub stream: String,
    /// Messages waiting (in-process) or the stream length (Redis)
    pub queued: usize,
    pub has_consumer: bool,
}

/// Statistics about a queue backend.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Backend type identifier
    pub backend_type: String,
    pub running: bool,
    pub streams: Vec<StreamStats>,
}

impl QueueStats {
    pub fn total_queued(&self) -> usize {
        self.streams.iter().map(|s| s.queued).sum()
    }
}

/// Task queue backend.
///
/// Producers call [`append`](QueueBackend::append); consumers are attached
/// with [`register`](QueueBackend::register) before [`run`](QueueBackend::run)
/// is spawned in the background.
///
/// # Lifecycle
///
/// `register* -> run (spawned) -> shutdown -> close`. `close` is idempotent
/// and may be called without `run` ever having started.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; a single instance is shared behind
/// an `Arc` between producers, the runner task and the lifecycle owner.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Backend kind, `"memory"` or `"redis"`.
    fn name(&self) -> &'static str;

    /// Hand a message over for eventual delivery.
    ///
    /// Returns once the message is queued, without waiting for a consumer.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::BackendUnavailable` if the backing store cannot be reached,
    /// `QueueError::InvalidMessage` if the message has no stream and
    /// `QueueError::Closed` after [`close`](QueueBackend::close).
    async fn append(&self, message: Message) -> Result<()>;

    /// Attach the handler for `stream`, replacing any previous one.
    fn register(&self, stream: &str, handler: Arc<dyn MessageHandler>);

    /// Start all registered consumers and wait until shutdown.
    async fn run(&self) -> Result<()>;

    /// Stop consuming, drain what the backend can within its bound, and unblock `run`.
    async fn shutdown(&self);

    /// Release backend resources.
    async fn close(&self) -> Result<()>;

    fn is_running(&self) -> bool;

    async fn stats(&self) -> QueueStats;
}

pub(crate) fn ensure_stream(message: &Message) -> Result<String> {
    let stream = message.stream();
    if stream.is_empty() {
        return Err(QueueError::InvalidMessage(format!(
            "message {} has no stream",
            message.id()
        )));
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Values;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_handler_fn_receives_snapshot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |msg: Message| {
            let counter = counter.clone();
            async move {
                assert_eq!(msg.stream(), "email");
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });

        let msg = Message::new("email", Values::new());
        handler.handle(&msg).await.unwrap();
        handler.handle(&msg).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_fn_propagates_failure() {
        let handler = handler_fn(|_msg: Message| async { Err::<(), _>(anyhow::anyhow!("smtp down")) });

        let err = handler.handle(&Message::new("email", Values::new())).await.unwrap_err();
        assert_eq!(err.to_string(), "smtp down");
    }

    #[test]
    fn test_ensure_stream_rejects_empty() {
        let msg = Message::new("", Values::new());
        assert!(matches!(ensure_stream(&msg), Err(QueueError::InvalidMessage(_))));
        assert_eq!(ensure_stream(&Message::new("sms", Values::new())).unwrap(), "sms");
    }

    #[test]
    fn test_stats_total() {
        let stats = QueueStats {
            backend_type: "memory".to_string(),
            running: false,
            streams: vec![
                StreamStats { stream: "a".into(), queued: 2, has_consumer: true },
                StreamStats { stream: "b".into(), queued: 3, has_consumer: false },
            ],
        };
        assert_eq!(stats.total_queued(), 5);
    }
}
