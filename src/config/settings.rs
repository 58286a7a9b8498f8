use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Retry backoff strategy names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    None,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Backend driver: "memory" or "redis"
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
    /// In-process buffer size per stream, 0 means unbounded
    #[serde(default)]
    pub pool_num: usize,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Consumer name inside the group; generated per instance when unset
    #[serde(default)]
    pub consumer_name: Option<String>,
    /// Deliveries before a failing message is discarded
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Overrides the backend's default retry backoff
    #[serde(default)]
    pub retry_backoff: Option<BackoffStrategy>,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Entries fetched per XREADGROUP call
    #[serde(default = "default_read_count")]
    pub read_count: usize,
    /// XREADGROUP block timeout
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Streams consumed by the service binary
    #[serde(default)]
    pub streams: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_driver() -> String {
    "memory".to_string()
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_consumer_group() -> String {
    "default_group".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_read_count() -> usize {
    10
}

fn default_block_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("queue.driver", "memory")?
            .set_default("queue.consumer_group", "default_group")?
            .set_default("log.level", "info")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // ARA_QUEUE__DRIVER, ARA_QUEUE__POOL_NUM, ARA_LOG__LEVEL, etc.
            .add_source(
                Environment::with_prefix("ARA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("queue.streams"),
            );

        builder.build()?.try_deserialize()
    }
}

impl QueueConfig {
    /// Human readable Redis address, never includes the password.
    pub fn redis_addr(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.db)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            host: default_redis_host(),
            port: default_redis_port(),
            password: String::new(),
            db: 0,
            pool_num: 0,
            consumer_group: default_consumer_group(),
            consumer_name: None,
            max_attempts: default_max_attempts(),
            retry_backoff: None,
            retry_delay_ms: default_retry_delay_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            read_count: default_read_count(),
            block_ms: default_block_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            streams: vec![],
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
