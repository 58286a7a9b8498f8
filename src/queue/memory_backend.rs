//! In-memory task queue backend.
//!
//! Each stream gets its own FIFO, drained by a single consumer task per
//! registered stream. Messages are held in memory and lost on restart.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::metrics::{ConsumerGuard, DeliveryMetrics, DRAIN_TIMEOUTS_TOTAL};

use super::backend::{
    ensure_stream, MessageHandler, QueueBackend, QueueStats, StreamStats,
};
use super::message::Message;
use super::retry::RetryPolicy;

const BACKEND: &str = "memory";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configuration for the in-memory backend
#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    /// Per-stream capacity, 0 means unbounded
    pub pool_num: usize,
    pub retry: RetryPolicy,
    /// Upper bound for draining queued work on shutdown
    pub drain_timeout: Duration,
    /// How long a consumer waits for work before re-checking the running flag
    pub poll_interval: Duration,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            pool_num: 0,
            retry: RetryPolicy::linear(),
            drain_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl MemoryQueueConfig {
    pub fn from_settings(settings: &QueueConfig) -> Self {
        Self {
            pool_num: settings.pool_num,
            retry: RetryPolicy::from_config(settings, RetryPolicy::linear()),
            drain_timeout: Duration::from_millis(settings.drain_timeout_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
        }
    }
}

/// FIFO and bookkeeping for one stream.
///
/// `outstanding` counts messages accepted by `append` that are not yet
/// resolved (processed or discarded); a retried message stays outstanding
/// and keeps its capacity slot while it waits for the next attempt.
struct StreamQueue {
    name: String,
    items: Mutex<VecDeque<Message>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    /// Signalled when an item is pushed
    available: Notify,
    /// Signalled when `outstanding` drops to zero
    drained: Notify,
    outstanding: AtomicUsize,
    /// Capacity slots, `None` when unbounded
    slots: Option<Semaphore>,
}

impl StreamQueue {
    fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            items: Mutex::new(VecDeque::new()),
            handler: RwLock::new(None),
            available: Notify::new(),
            drained: Notify::new(),
            outstanding: AtomicUsize::new(0),
            slots: (capacity > 0).then(|| Semaphore::new(capacity)),
        }
    }

    /// Enqueue a new message, waiting for a free slot on bounded queues.
    async fn push(&self, message: Message) -> Result<(), QueueError> {
        if let Some(slots) = &self.slots {
            slots
                .acquire()
                .await
                .map_err(|_| QueueError::Closed)?
                .forget();
        }

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        lock(&self.items).push_back(message);
        self.available.notify_one();
        Ok(())
    }

    /// Put a failed message back at the tail. It keeps its slot.
    fn requeue(&self, message: Message) {
        lock(&self.items).push_back(message);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        lock(&self.items).pop_front()
    }

    /// Next message, or `None` if nothing arrived within `wait`.
    async fn next(&self, wait: Duration) -> Option<Message> {
        if let Some(message) = self.pop() {
            return Some(message);
        }
        let _ = timeout(wait, self.available.notified()).await;
        self.pop()
    }

    /// Mark one message as finally resolved.
    fn complete(&self) {
        if let Some(slots) = &self.slots {
            slots.add_permits(1);
        }
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn len(&self) -> usize {
        lock(&self.items).len()
    }

    fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a handler, returning whether one was replaced.
    fn set_handler(&self, handler: Arc<dyn MessageHandler>) -> bool {
        self.handler
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handler)
            .is_some()
    }

    fn close(&self) {
        if let Some(slots) = &self.slots {
            slots.close();
        }
    }
}

/// Consumer loop for one stream.
struct StreamConsumer {
    queue: Arc<StreamQueue>,
    running: Arc<AtomicBool>,
    retry: RetryPolicy,
    poll_interval: Duration,
}

impl StreamConsumer {
    async fn run(self) {
        let _guard = ConsumerGuard::new(BACKEND);
        tracing::debug!(stream = %self.queue.name, "Started consuming messages");

        loop {
            match self.queue.next(self.poll_interval).await {
                Some(message) => self.deliver(message).await,
                None => {
                    // Keep going after shutdown until the stream is empty
                    if !self.running.load(Ordering::Acquire) && self.queue.is_empty() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(stream = %self.queue.name, "Stopped consuming messages");
    }

    async fn deliver(&self, message: Message) {
        let stream = self.queue.name.as_str();

        let Some(handler) = self.queue.handler() else {
            tracing::warn!(stream = %stream, "No handler for stream, requeueing message");
            self.queue.requeue(message);
            tokio::time::sleep(self.poll_interval).await;
            return;
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(handler.handle(&message)).catch_unwind().await;
        let elapsed = started.elapsed().as_secs_f64();

        let error = match outcome {
            Ok(Ok(())) => {
                DeliveryMetrics::record_processed(BACKEND, stream, elapsed);
                tracing::debug!(
                    stream = %stream,
                    message_id = %message.id(),
                    "Message processed successfully"
                );
                self.queue.complete();
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => anyhow::anyhow!("handler panicked"),
        };

        let failures = message.record_failure();
        tracing::error!(
            stream = %stream,
            message_id = %message.id(),
            error_count = failures,
            error = %error,
            "Error processing message"
        );

        if self.retry.should_retry(failures) {
            let delay = self.retry.delay(failures);
            DeliveryMetrics::record_failed(BACKEND, stream, elapsed, true);
            tracing::warn!(
                stream = %stream,
                message_id = %message.id(),
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Retrying message"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.queue.requeue(message);
        } else {
            DeliveryMetrics::record_failed(BACKEND, stream, elapsed, false);
            tracing::error!(
                stream = %stream,
                message_id = %message.id(),
                attempts = failures,
                "Message failed after final attempt, discarding"
            );
            self.queue.complete();
        }
    }
}

/// In-memory task queue backend.
///
/// Streams are created lazily on first `append` or `register`. With
/// `pool_num > 0` each stream holds at most that many unresolved messages
/// and `append` waits for a slot, throttling producers when consumers fall
/// behind.
pub struct MemoryQueueBackend {
    config: MemoryQueueConfig,
    queues: DashMap<String, Arc<StreamQueue>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    stopping: AtomicBool,
    closed: AtomicBool,
    /// `true` once shutdown has completed
    shutdown_tx: watch::Sender<bool>,
}

impl MemoryQueueBackend {
    /// Create a new memory queue backend with the given configuration.
    pub fn new(config: MemoryQueueConfig) -> Self {
        tracing::debug!(pool_num = config.pool_num, "Memory queue backend initialized");
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            queues: DashMap::new(),
            tasks: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            stopping: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Unbounded backend with default retry and drain settings.
    pub fn unbounded() -> Self {
        Self::new(MemoryQueueConfig::default())
    }

    pub fn config(&self) -> &MemoryQueueConfig {
        &self.config
    }

    fn queue(&self, stream: &str) -> Arc<StreamQueue> {
        self.queues
            .entry(stream.to_string())
            .or_insert_with(|| {
                tracing::debug!(stream = %stream, "Created new queue");
                Arc::new(StreamQueue::new(stream, self.config.pool_num))
            })
            .value()
            .clone()
    }

    /// Messages waiting on `stream` (not counting one being handled).
    pub fn queued(&self, stream: &str) -> usize {
        self.queues.get(stream).map(|q| q.len()).unwrap_or(0)
    }

    /// Messages accepted on `stream` and not yet processed or discarded.
    pub fn outstanding(&self, stream: &str) -> usize {
        self.queues.get(stream).map(|q| q.outstanding()).unwrap_or(0)
    }

    fn spawn_consumer(&self, queue: Arc<StreamQueue>) {
        let mut tasks = lock(&self.tasks);
        if tasks.get(&queue.name).is_some_and(|t| !t.is_finished()) {
            return;
        }

        let name = queue.name.clone();
        let consumer = StreamConsumer {
            queue,
            running: self.running.clone(),
            retry: self.config.retry.clone(),
            poll_interval: self.config.poll_interval,
        };
        tasks.insert(name, tokio::spawn(consumer.run()));
    }

    async fn drain(&self, streams: &[Arc<StreamQueue>]) {
        let drains = streams.iter().map(|q| q.wait_drained());

        match timeout(self.config.drain_timeout, join_all(drains)).await {
            Ok(_) => {
                tracing::debug!(streams = streams.len(), "Queues drained successfully");
            }
            Err(_) => {
                for queue in streams.iter().filter(|q| q.outstanding() > 0) {
                    DRAIN_TIMEOUTS_TOTAL.with_label_values(&[BACKEND]).inc();
                    tracing::warn!(
                        stream = %queue.name,
                        remaining = queue.outstanding(),
                        timeout_ms = self.config.drain_timeout.as_millis() as u64,
                        "Queue drain timeout, forcing shutdown"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn append(&self, message: Message) -> Result<(), QueueError> {
        // Nothing consumes after shutdown, so stop accepting work
        if self.closed.load(Ordering::Acquire) || self.stopping.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let stream = ensure_stream(&message)?;
        let message_id = message.id().to_string();

        self.queue(&stream).push(message).await?;
        DeliveryMetrics::record_appended(BACKEND, &stream);

        tracing::debug!(
            stream = %stream,
            message_id = %message_id,
            "Message appended to queue"
        );

        Ok(())
    }

    fn register(&self, stream: &str, handler: Arc<dyn MessageHandler>) {
        let queue = self.queue(stream);

        if queue.set_handler(handler) {
            tracing::warn!(stream = %stream, "Replaced existing consumer for queue");
        } else {
            tracing::info!(stream = %stream, "Consumer registered for queue");
        }

        if self.running.load(Ordering::Acquire) {
            self.spawn_consumer(queue);
        }
    }

    async fn run(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        if self.stopping.load(Ordering::Acquire) {
            tracing::warn!("Memory queue backend already shut down, not starting");
            return Ok(());
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        if self.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("Memory queue backend already running");
        } else {
            let registered: Vec<Arc<StreamQueue>> = self
                .queues
                .iter()
                .filter(|q| q.handler().is_some())
                .map(|q| q.value().clone())
                .collect();

            for queue in &registered {
                self.spawn_consumer(queue.clone());
            }

            tracing::info!(
                consumers = registered.len(),
                "Memory queue backend started"
            );
        }

        // Wait for shutdown signal
        let _ = shutdown_rx.wait_for(|stopped| *stopped).await;

        tracing::info!("Memory queue backend stopped");
        Ok(())
    }

    async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
            return;
        }

        tracing::info!("Shutting down memory queue backend...");
        let start = Instant::now();
        self.running.store(false, Ordering::Release);

        let consuming: Vec<String> = lock(&self.tasks).keys().cloned().collect();
        let mut consumed = Vec::with_capacity(consuming.len());

        for queue in self.queues.iter() {
            if consuming.contains(queue.key()) {
                consumed.push(queue.value().clone());
            } else if !queue.is_empty() {
                tracing::warn!(
                    stream = %queue.key(),
                    pending = queue.len(),
                    "Queue has messages but no running consumer"
                );
            }
        }

        self.drain(&consumed).await;

        // Cancel consumers still running past the drain bound
        let handles: Vec<(String, JoinHandle<()>)> = lock(&self.tasks).drain().collect();
        for (stream, handle) in handles {
            if !handle.is_finished() {
                handle.abort();
                tracing::debug!(stream = %stream, "Consumer task cancelled");
            }
            let _ = handle.await;
        }

        self.shutdown_tx.send_replace(true);
        tracing::info!(
            duration_ms = start.elapsed().as_millis() as u64,
            "Memory queue backend shutdown complete"
        );
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown().await;

        for queue in self.queues.iter() {
            queue.close();
            let abandoned = queue.len();
            if abandoned > 0 {
                tracing::warn!(
                    stream = %queue.key(),
                    abandoned = abandoned,
                    "Discarding unprocessed messages on close"
                );
            }
        }

        tracing::info!("Memory queue backend closed");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn stats(&self) -> QueueStats {
        let mut streams: Vec<StreamStats> = self
            .queues
            .iter()
            .map(|q| StreamStats {
                stream: q.key().clone(),
                queued: q.len(),
                has_consumer: q.handler().is_some(),
            })
            .collect();
        streams.sort_by(|a, b| a.stream.cmp(&b.stream));

        QueueStats {
            backend_type: BACKEND.to_string(),
            running: self.is_running(),
            streams,
        }
    }
}
