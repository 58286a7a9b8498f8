use redis::RedisError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// The backing resource could not be reached (refused, dropped, timed out).
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Redis error: {0}")]
    Redis(RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed stream entry {entry_id}: {reason}")]
    MalformedEntry { entry_id: String, reason: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Queue backend is closed")]
    Closed,

    /// The task driving a backend panicked or was cancelled.
    #[error("Queue runner failed: {0}")]
    Runner(String),
}

impl From<RedisError> for QueueError {
    fn from(err: RedisError) -> Self {
        if is_connection_error(&err) {
            QueueError::BackendUnavailable(err.to_string())
        } else {
            QueueError::Redis(err)
        }
    }
}

/// Whether a Redis error means the server could not be reached, as opposed
/// to a command being rejected.
pub(crate) fn is_connection_error(err: &RedisError) -> bool {
    err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() || err.is_timeout()
}

impl QueueError {
    /// Errors that are worth retrying once the connection is re-established.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::BackendUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_maps_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: QueueError = RedisError::from(io).into();
        assert!(matches!(err, QueueError::BackendUnavailable(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_command_error_stays_redis() {
        let redis_err = RedisError::from((redis::ErrorKind::TypeError, "wrong type"));
        let err: QueueError = redis_err.into();
        assert!(matches!(err, QueueError::Redis(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = QueueError::MalformedEntry {
            entry_id: "1-0".to_string(),
            reason: "bad error_count".to_string(),
        };
        assert_eq!(err.to_string(), "Malformed stream entry 1-0: bad error_count");
        assert_eq!(QueueError::Closed.to_string(), "Queue backend is closed");
    }
}
