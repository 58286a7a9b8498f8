//! Redis connection pool for the stream queue backend.
//!
//! Producers share one lazily established multiplexed connection that is
//! dropped and re-established after connection errors. Consumers doing
//! blocking reads take a dedicated connection so a `BLOCK` never stalls
//! the shared one.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisResult};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::config::QueueConfig;
use crate::error::{is_connection_error, QueueError};

/// Build connection info from the queue settings.
pub fn connection_info(config: &QueueConfig) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
        redis: RedisConnectionInfo {
            db: config.db,
            password: (!config.password.is_empty()).then(|| config.password.clone()),
            ..Default::default()
        },
    }
}

/// Redis connection pool for stream commands.
pub struct RedisPool {
    /// Redis client for creating connections
    client: Client,

    /// Multiplexed connection (shared across producers)
    connection: RwLock<Option<MultiplexedConnection>>,

    /// `host:port/db`, never includes the password
    addr: String,

    connect_timeout: Duration,
}

impl RedisPool {
    /// Create a new pool. No connection is made until first use.
    pub fn new(config: &QueueConfig) -> Result<Self, QueueError> {
        let client = Client::open(connection_info(config))?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            addr: config.redis_addr(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        })
    }

    /// Get the shared connection, establishing it if none exists.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, QueueError> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut conn_guard = self.connection.write().await;

        // Double-check in case another task connected while we waited
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        let conn = self.open().await?;
        *conn_guard = Some(conn.clone());
        tracing::info!(addr = %self.addr, "Redis pool connection established");
        Ok(conn)
    }

    /// Open a connection that is not shared with producers.
    pub async fn dedicated_connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.open().await
    }

    async fn open(&self) -> Result<MultiplexedConnection, QueueError> {
        match timeout(self.connect_timeout, self.client.get_multiplexed_tokio_connection()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => {
                tracing::error!(addr = %self.addr, error = %e, "Failed to connect to Redis");
                Err(QueueError::BackendUnavailable(format!("{}: {}", self.addr, e)))
            }
            Err(_) => {
                tracing::error!(
                    addr = %self.addr,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "Timed out connecting to Redis"
                );
                Err(QueueError::BackendUnavailable(format!(
                    "{}: connect timed out after {:?}",
                    self.addr, self.connect_timeout
                )))
            }
        }
    }

    /// Run a command on the shared connection.
    ///
    /// Connection errors clear the shared connection so the next call reconnects.
    /// A server that does not answer within the connect timeout is treated the
    /// same way.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match timeout(self.connect_timeout, f(conn)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                if is_connection_error(&e) {
                    tracing::warn!(addr = %self.addr, error = %e, "Redis connection lost, will reconnect");
                    self.reset().await;
                }
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!(
                    addr = %self.addr,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "Redis did not respond, will reconnect"
                );
                self.reset().await;
                Err(QueueError::BackendUnavailable(format!(
                    "{}: no response within {:?}",
                    self.addr, self.connect_timeout
                )))
            }
        }
    }

    /// Forget the shared connection.
    pub async fn reset(&self) {
        let mut conn_guard = self.connection.write().await;
        *conn_guard = None;
    }

    /// Ping Redis to check connectivity.
    pub async fn ping(&self) -> Result<(), QueueError> {
        let _: String = self
            .execute(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Get the Redis address (for logging).
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> QueueConfig {
        QueueConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_ms: 500,
            ..Default::default()
        }
    }

    #[test]
    fn test_connection_info() {
        let config = QueueConfig {
            host: "redis.internal".to_string(),
            port: 6380,
            password: "secret".to_string(),
            db: 3,
            ..Default::default()
        };
        let info = connection_info(&config);

        assert!(matches!(
            info.addr,
            ConnectionAddr::Tcp(ref host, 6380) if host == "redis.internal"
        ));
        assert_eq!(info.redis.db, 3);
        assert_eq!(info.redis.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_empty_password_is_omitted() {
        let info = connection_info(&QueueConfig::default());
        assert!(info.redis.password.is_none());
    }

    #[test]
    fn test_pool_creation() {
        let pool = RedisPool::new(&QueueConfig::default()).unwrap();
        assert_eq!(pool.addr(), "localhost:6379/0");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let pool = RedisPool::new(&unreachable_config()).unwrap();

        let err = pool.ping().await.unwrap_err();
        assert!(matches!(err, QueueError::BackendUnavailable(_)));
        assert!(!pool.is_connected().await);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        use redis::AsyncCommands;

        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let pool = RedisPool::new(&QueueConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout_ms: 200,
            ..Default::default()
        })
        .unwrap();

        let result = timeout(
            Duration::from_secs(2),
            pool.execute(|mut conn| async move { conn.xlen::<_, usize>("email").await }),
        )
        .await
        .expect("command should not hang");

        assert!(matches!(result, Err(QueueError::BackendUnavailable(_))));
        assert!(!pool.is_connected().await);
        server.abort();
    }
}
