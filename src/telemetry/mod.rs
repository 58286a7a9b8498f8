//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level. The output format
//! is either human readable (`pretty`) or one JSON object per line (`json`).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Result type for telemetry operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Telemetry-specific error type
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Unknown log format: {0}")]
    UnknownFormat(String),
    #[error("Failed to install tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Build the level filter, preferring `RUST_LOG` when it is set.
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global tracing subscriber.
///
/// Fails if the format is not recognised or a global subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> TelemetryResult<()> {
    let filter = env_filter(config);

    match config.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        "pretty" | "text" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
        other => return Err(TelemetryError::UnknownFormat(other.to_string())),
    }
    .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    tracing::info!(level = %config.level, format = %config.format, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_format_is_rejected() {
        let config = LogConfig {
            level: "info".to_string(),
            format: "xml".to_string(),
        };

        assert!(matches!(
            init_tracing(&config),
            Err(TelemetryError::UnknownFormat(ref f)) if f == "xml"
        ));
    }
}
