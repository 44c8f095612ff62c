//! Redis Streams plumbing for the booru gateway.
//!
//! This crate provides:
//! - The request stream (consumer group read/ack/claim) and response publisher
//! - Token-owned TTL locks with heartbeat extension
//! - The atomic counter-window rate limiter
//! - The three-layer dedup protocol primitives
//! - DLQ/dead-queue utilities with encrypted payloads

pub mod dedup;
pub mod dlq;
pub mod error;
pub mod lock;
pub mod ratelimit;
pub mod streams;

pub use dedup::Deduplicator;
pub use dlq::{retry_backoff_ms, DeadLetterQueue, DlqError, DlqPayloadMode, DlqResult};
pub use error::{QueueError, QueueResult};
pub use lock::{query_lock_key, LockManager};
pub use ratelimit::{RateLimitStats, RateLimiter, SlidingWindow};
pub use streams::{stream_name, RequestStream, ResponsePublisher, StreamKind};
