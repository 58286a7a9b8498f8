//! Redis-based task queue backend using Redis Streams.
//!
//! Every registered stream gets a consumer task reading through a consumer
//! group, so several processes sharing a group split the work between them.
//! Entries are persisted and survive service restarts; an entry that was in
//! flight when its consumer stopped stays pending in the group.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, RedisResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::metrics::{ConsumerGuard, DeliveryMetrics, READ_ERRORS_TOTAL};
use crate::redis::RedisPool;

use super::backend::{
    ensure_stream, MessageHandler, QueueBackend, QueueStats, StreamStats,
};
use super::message::Message;
use super::retry::{BackoffConfig, RetryPolicy};

const BACKEND: &str = "redis";

type Handlers = Arc<DashMap<String, Arc<dyn MessageHandler>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configuration for the Redis Streams backend
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    pub consumer_group: String,
    /// Unique per backend instance
    pub consumer_name: String,
    pub retry: RetryPolicy,
    /// Entries fetched per read
    pub read_count: usize,
    /// How long a read blocks waiting for entries
    pub block: Duration,
    /// Delay schedule after failed reads or reconnects
    pub reconnect: BackoffConfig,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self::from_settings(&QueueConfig::default())
    }
}

impl RedisQueueConfig {
    pub fn from_settings(settings: &QueueConfig) -> Self {
        let consumer_name = settings
            .consumer_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));

        Self {
            consumer_group: settings.consumer_group.clone(),
            consumer_name,
            retry: RetryPolicy::from_config(settings, RetryPolicy::immediate()),
            read_count: settings.read_count.max(1),
            block: Duration::from_millis(settings.block_ms),
            reconnect: BackoffConfig::default(),
        }
    }
}

/// Whether group creation failed only because the group already exists.
fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP") || err.to_string().contains("BUSYGROUP")
}

/// Create the consumer group (and the stream) unless it already exists.
async fn ensure_group(
    conn: &mut MultiplexedConnection,
    stream: &str,
    group: &str,
) -> Result<(), QueueError> {
    let result: RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
    match result {
        Ok(()) => {
            tracing::info!(stream = %stream, group = %group, "Created consumer group");
            Ok(())
        }
        Err(e) if is_busy_group(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Flatten an entry's field map to strings.
fn entry_fields(entry: &StreamId) -> Result<HashMap<String, String>, QueueError> {
    entry
        .map
        .iter()
        .map(|(field, value)| {
            redis::from_redis_value::<String>(value)
                .map(|v| (field.clone(), v))
                .map_err(|e| QueueError::MalformedEntry {
                    entry_id: entry.id.clone(),
                    reason: format!("field {}: {}", field, e),
                })
        })
        .collect()
}

/// What happens to an entry once its handler has returned.
#[derive(Debug, PartialEq)]
enum Settlement {
    Ack,
    /// Append a copy with the bumped error count, then ack the entry
    Requeue {
        attempt: u32,
        fields: Vec<(&'static str, String)>,
    },
    /// Out of attempts, ack the entry and drop the message
    Discard { attempts: u32 },
}

/// Decide the fate of a delivered entry. A failure is counted on `message`.
fn settle(message: &Message, handled: bool, retry: &RetryPolicy) -> Result<Settlement, QueueError> {
    if handled {
        return Ok(Settlement::Ack);
    }

    let failures = message.record_failure();
    if retry.should_retry(failures) {
        Ok(Settlement::Requeue {
            attempt: failures,
            fields: message.to_entry_fields()?,
        })
    } else {
        Ok(Settlement::Discard { attempts: failures })
    }
}

/// Consumer loop for one stream.
struct StreamConsumer {
    stream: String,
    pool: Arc<RedisPool>,
    handlers: Handlers,
    running: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
    config: RedisQueueConfig,
}

impl StreamConsumer {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !*self.shutdown_rx.borrow()
    }

    async fn run(mut self) {
        let _guard = ConsumerGuard::new(BACKEND);
        let mut failures = 0u32;

        tracing::debug!(
            stream = %self.stream,
            group = %self.config.consumer_group,
            consumer = %self.config.consumer_name,
            "Started consuming stream"
        );

        'connect: while self.is_running() {
            let mut conn = match self.prepare().await {
                Ok(conn) => conn,
                Err(e) => {
                    if !self.pause(&mut failures, &e).await {
                        break;
                    }
                    continue;
                }
            };

            while self.is_running() {
                match self.read(&mut conn).await {
                    Ok(Some(entries)) => {
                        failures = 0;
                        for entry in entries {
                            self.process(&mut conn, entry).await;
                        }
                    }
                    Ok(None) => break 'connect,
                    Err(e) => {
                        // Reconnect, which also recreates a deleted group
                        if !self.pause(&mut failures, &e).await {
                            break 'connect;
                        }
                        continue 'connect;
                    }
                }
            }
        }

        tracing::debug!(stream = %self.stream, "Stopped consuming stream");
    }

    async fn prepare(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut conn = self.pool.dedicated_connection().await?;
        ensure_group(&mut conn, &self.stream, &self.config.consumer_group).await?;
        Ok(conn)
    }

    /// Read the next batch for this consumer. `None` means shutdown was signalled.
    async fn read(
        &mut self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Option<Vec<StreamId>>, QueueError> {
        let options = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.config.consumer_name)
            .count(self.config.read_count)
            .block(self.config.block.as_millis() as usize);

        let keys = [self.stream.as_str()];
        let ids = [">"];

        tokio::select! {
            _ = self.shutdown_rx.wait_for(|stopped| *stopped) => Ok(None),
            reply = conn.xread_options::<_, _, Option<StreamReadReply>>(&keys, &ids, &options) => {
                let entries = reply?
                    .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
                    .unwrap_or_default();
                Ok(Some(entries))
            }
        }
    }

    /// Back off after an error. Returns `false` if shutdown arrived meanwhile.
    async fn pause(&mut self, failures: &mut u32, error: &QueueError) -> bool {
        *failures += 1;
        let delay = self.config.reconnect.delay_for(*failures);

        READ_ERRORS_TOTAL
            .with_label_values(&[BACKEND, self.stream.as_str()])
            .inc();
        if error.is_transient() {
            tracing::warn!(
                stream = %self.stream,
                error = %error,
                attempt = *failures,
                delay_ms = delay.as_millis() as u64,
                "Stream read failed, backing off"
            );
        } else {
            // Server rejected the command
            tracing::error!(
                stream = %self.stream,
                error = %error,
                attempt = *failures,
                delay_ms = delay.as_millis() as u64,
                "Stream command rejected, backing off"
            );
        }

        tokio::select! {
            _ = self.shutdown_rx.wait_for(|stopped| *stopped) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn process(&self, conn: &mut MultiplexedConnection, entry: StreamId) {
        let message = match entry_fields(&entry)
            .and_then(|fields| Message::from_entry(&entry.id, &self.stream, &fields))
        {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    stream = %self.stream,
                    entry_id = %entry.id,
                    error = %e,
                    "Malformed stream entry, acknowledging"
                );
                self.ack(conn, &entry.id).await;
                return;
            }
        };

        let Some(handler) = self.handlers.get(&self.stream).map(|h| h.value().clone()) else {
            tracing::warn!(stream = %self.stream, entry_id = %entry.id, "No handler for stream");
            return;
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(handler.handle(&message)).catch_unwind().await;
        let elapsed = started.elapsed().as_secs_f64();

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(anyhow::anyhow!("handler panicked")),
        };

        let settlement = match settle(&message, error.is_none(), &self.config.retry) {
            Ok(settlement) => settlement,
            Err(e) => {
                tracing::error!(
                    stream = %self.stream,
                    message_id = %message.id(),
                    entry_id = %entry.id,
                    error = %e,
                    "Failed to encode message for retry, entry left pending"
                );
                return;
            }
        };

        if let Some(error) = error {
            tracing::error!(
                stream = %self.stream,
                message_id = %message.id(),
                error_count = message.error_count(),
                error = %error,
                "Error processing message"
            );
        }

        match settlement {
            Settlement::Ack => {
                DeliveryMetrics::record_processed(BACKEND, &self.stream, elapsed);
                tracing::debug!(
                    stream = %self.stream,
                    message_id = %message.id(),
                    entry_id = %entry.id,
                    "Message processed successfully"
                );
            }
            Settlement::Requeue { attempt, fields } => {
                let delay = self.config.retry.delay(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                match self.requeue(conn, &fields).await {
                    Ok(new_entry_id) => {
                        DeliveryMetrics::record_failed(BACKEND, &self.stream, elapsed, true);
                        tracing::warn!(
                            stream = %self.stream,
                            message_id = %message.id(),
                            attempt = attempt,
                            new_entry_id = %new_entry_id,
                            "Retrying message"
                        );
                    }
                    Err(e) => {
                        // Unacked entries stay in the pending list
                        tracing::error!(
                            stream = %self.stream,
                            message_id = %message.id(),
                            entry_id = %entry.id,
                            error = %e,
                            "Failed to requeue message, entry left pending"
                        );
                        return;
                    }
                }
            }
            Settlement::Discard { attempts } => {
                DeliveryMetrics::record_failed(BACKEND, &self.stream, elapsed, false);
                tracing::error!(
                    stream = %self.stream,
                    message_id = %message.id(),
                    attempts = attempts,
                    "Message failed after final attempt, discarding"
                );
            }
        }

        self.ack(conn, &entry.id).await;
    }

    async fn requeue(
        &self,
        conn: &mut MultiplexedConnection,
        fields: &[(&'static str, String)],
    ) -> Result<String, QueueError> {
        let id: String = conn.xadd(&self.stream, "*", fields).await?;
        Ok(id)
    }

    async fn ack(&self, conn: &mut MultiplexedConnection, entry_id: &str) {
        let result: RedisResult<i64> = conn
            .xack(&self.stream, &self.config.consumer_group, &[entry_id])
            .await;
        if let Err(e) = result {
            tracing::warn!(
                stream = %self.stream,
                entry_id = %entry_id,
                error = %e,
                "Failed to acknowledge entry"
            );
        }
    }
}

/// Redis Streams task queue backend.
pub struct RedisQueueBackend {
    pool: Arc<RedisPool>,
    config: RedisQueueConfig,
    handlers: Handlers,
    /// Streams appended to by this instance, for stats
    produced: DashSet<String>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    stopping: AtomicBool,
    closed: AtomicBool,
    /// Tells consumers to stop
    shutdown_tx: watch::Sender<bool>,
    /// `true` once shutdown has completed
    stopped_tx: watch::Sender<bool>,
}

impl RedisQueueBackend {
    /// Connect to Redis and verify the server answers.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::BackendUnavailable` if the server cannot be reached
    /// within `connect_timeout_ms`.
    pub async fn connect(settings: &QueueConfig) -> Result<Self, QueueError> {
        let pool = Arc::new(RedisPool::new(settings)?);
        pool.ping().await?;

        let backend = Self::with_pool(pool, RedisQueueConfig::from_settings(settings));
        tracing::info!(
            addr = %backend.pool.addr(),
            group = %backend.config.consumer_group,
            consumer = %backend.config.consumer_name,
            "Redis queue backend connected"
        );
        Ok(backend)
    }

    /// Build on an existing pool without checking connectivity.
    pub fn with_pool(pool: Arc<RedisPool>, config: RedisQueueConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);
        Self {
            pool,
            config,
            handlers: Arc::new(DashMap::new()),
            produced: DashSet::new(),
            tasks: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            stopping: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_tx,
            stopped_tx,
        }
    }

    pub fn config(&self) -> &RedisQueueConfig {
        &self.config
    }

    pub fn consumer_name(&self) -> &str {
        &self.config.consumer_name
    }

    fn spawn_consumer(&self, stream: &str) {
        let mut tasks = lock(&self.tasks);
        if tasks.get(stream).is_some_and(|t| !t.is_finished()) {
            return;
        }

        let consumer = StreamConsumer {
            stream: stream.to_string(),
            pool: self.pool.clone(),
            handlers: self.handlers.clone(),
            running: self.running.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            config: self.config.clone(),
        };
        tasks.insert(stream.to_string(), tokio::spawn(consumer.run()));
    }

    async fn stream_len(&self, stream: &str) -> usize {
        let key = stream.to_string();
        match self
            .pool
            .execute(|mut conn| async move { conn.xlen::<_, usize>(&key).await })
            .await
        {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "Failed to read stream length");
                0
            }
        }
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn append(&self, message: Message) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let stream = ensure_stream(&message)?;
        let fields = message.to_entry_fields()?;

        let key = stream.clone();
        let entry_id: String = self
            .pool
            .execute(|mut conn| async move { conn.xadd(&key, "*", fields.as_slice()).await })
            .await?;

        self.produced.insert(stream.clone());
        DeliveryMetrics::record_appended(BACKEND, &stream);

        tracing::debug!(
            stream = %stream,
            message_id = %message.id(),
            entry_id = %entry_id,
            "Message appended to Redis stream"
        );

        Ok(())
    }

    fn register(&self, stream: &str, handler: Arc<dyn MessageHandler>) {
        if self.handlers.insert(stream.to_string(), handler).is_some() {
            tracing::warn!(stream = %stream, "Replaced existing consumer for stream");
        } else {
            tracing::info!(
                stream = %stream,
                group = %self.config.consumer_group,
                "Consumer registered for stream"
            );
        }

        if self.running.load(Ordering::Acquire) {
            self.spawn_consumer(stream);
        }
    }

    async fn run(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        if self.stopping.load(Ordering::Acquire) {
            tracing::warn!("Redis queue backend already shut down, not starting");
            return Ok(());
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        if self.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("Redis queue backend already running");
        } else {
            let streams: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
            for stream in &streams {
                self.spawn_consumer(stream);
            }

            tracing::info!(
                consumers = streams.len(),
                consumer = %self.config.consumer_name,
                "Redis queue backend started"
            );
        }

        // Wait for shutdown signal
        let _ = shutdown_rx.wait_for(|stopped| *stopped).await;

        tracing::info!("Redis queue backend stopped");
        Ok(())
    }

    async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            let mut stopped_rx = self.stopped_tx.subscribe();
            let _ = stopped_rx.wait_for(|stopped| *stopped).await;
            return;
        }

        tracing::info!("Shutting down Redis queue backend...");
        self.running.store(false, Ordering::Release);
        self.shutdown_tx.send_replace(true);

        let handles: Vec<(String, JoinHandle<()>)> = lock(&self.tasks).drain().collect();
        for (stream, handle) in handles {
            if !handle.is_finished() {
                handle.abort();
                tracing::debug!(stream = %stream, "Consumer task cancelled");
            }
            let _ = handle.await;
        }

        self.stopped_tx.send_replace(true);
        tracing::info!("Redis queue backend shutdown complete");
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown().await;
        self.pool.reset().await;

        tracing::info!(addr = %self.pool.addr(), "Redis queue backend closed");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn stats(&self) -> QueueStats {
        let mut names: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        names.extend(self.produced.iter().map(|s| s.key().clone()));
        names.sort();
        names.dedup();

        let mut streams = Vec::with_capacity(names.len());
        for stream in names {
            streams.push(StreamStats {
                queued: self.stream_len(&stream).await,
                has_consumer: self.handlers.contains_key(&stream),
                stream,
            });
        }

        QueueStats {
            backend_type: BACKEND.to_string(),
            running: self.is_running(),
            streams,
        }
    }
}
