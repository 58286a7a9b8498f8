//! Task queue with pluggable storage backends.
//!
//! Producers `append` messages to named streams; a single registered
//! handler per stream consumes them asynchronously. Failed deliveries are
//! retried up to three times before the message is discarded.
//!
//! Two backends implement [`QueueBackend`]:
//! - [`MemoryQueueBackend`]: in-process FIFOs, optional per-stream capacity
//! - [`RedisQueueBackend`]: Redis Streams consumer groups, shared across processes
//!
//! Backends are built from configuration with [`setup_queue`] and kept in a
//! [`Runtime`](crate::runtime::Runtime) keyed by host name.

mod backend;
mod factory;
mod memory_backend;
mod message;
mod redis_backend;
mod retry;

pub use backend::{handler_fn, FnHandler, MessageHandler, QueueBackend, QueueStats, StreamStats};
pub use factory::{close_queue, setup_queue};
pub use memory_backend::{MemoryQueueBackend, MemoryQueueConfig};
pub use message::{
    Message, Values, FIELD_ERROR_COUNT, FIELD_ID, FIELD_STREAM, FIELD_VALUES, PREFIX_KEY,
};
pub use redis_backend::{RedisQueueBackend, RedisQueueConfig};
pub use retry::{Backoff, BackoffConfig, RetryPolicy};
