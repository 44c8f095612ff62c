//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] booru_queue::QueueError),

    #[error("DLQ error: {0}")]
    Dlq(#[from] booru_queue::DlqError),

    #[error("Cache error: {0}")]
    Cache(#[from] booru_cache::CacheError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] booru_upstream::UpstreamError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] booru_crypto::CryptoError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }
}
