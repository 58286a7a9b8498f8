//! Redis connectivity for the stream queue backend.

pub mod pool;

pub use pool::{connection_info, RedisPool};
