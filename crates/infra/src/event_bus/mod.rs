//! Durable queue backends.
//!
//! The queue abstraction lives in `annotflow-events` as pure mechanics. This module
//! provides infrastructure-backed implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;
