// Infrastructure layer (shared components)
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod metrics;

pub use infrastructure::redis;

// Domain layer
pub mod queue;
pub mod runtime;

// Application layer
pub mod app;

// Supporting modules
pub mod shutdown;
pub mod telemetry;
