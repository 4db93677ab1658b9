//! Broker error types.

use thiserror::Error;

/// Broker error type.
#[derive(Debug, Error)]
pub enum MqError {
    #[error("broker connect failed: {0}")]
    Connect(String),

    #[error("stream setup failed: {0}")]
    Stream(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("consumer closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, MqError>;
