//! Error types for the stream-processing core
//!
//! Library code returns [`StreamError`]; the binary boundary wraps it in
//! `anyhow` for context-rich startup failures.

use thiserror::Error;

/// Errors surfaced by the stream-processing core
#[derive(Debug, Error)]
pub enum StreamError {
    /// Malformed bus message payload
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Kafka consumer/producer failure
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Columnar store failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Keyed cache failure
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Metrics registration failure
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Invalid or missing configuration
    #[error("config error: {0}")]
    Config(String),

    /// Event failed validation and was skipped
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, StreamError>;
