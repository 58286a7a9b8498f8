//! Infrastructure layer modules
//!
//! - `redis`: Redis connection pool used by the stream backend

pub mod redis;
