//! Session-layer error types.

use thiserror::Error;

/// KV store error type.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("kv operation failed: {0}")]
    Operation(String),
}

/// Session error type.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    #[error("failed to create session: {0}")]
    Create(String),

    #[error("failed to destroy session: {0}")]
    Destroy(String),
}

/// Token validation error type.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("unknown token")]
    UnknownToken,
}
