mod settings;

pub use settings::{BackoffStrategy, LogConfig, QueueConfig, Settings};
