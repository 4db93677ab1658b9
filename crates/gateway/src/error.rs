//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    // Handshake rejections.
    #[error("token is required")]
    TokenRequired,

    #[error("invalid handshake uri")]
    InvalidUri,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The connection has already terminated.
    #[error("connection closed")]
    ConnClosed,

    #[error("request too frequently, please try again later")]
    RateLimited,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Dedup hit; the payload was already handled.
    #[error("message duplicated, ignore it")]
    MessageDuplicated,

    #[error("failed to cache message: {0}")]
    CacheMessage(String),

    #[error("failed to uncache message: {0}")]
    UncacheMessage(String),

    #[error("unknown message (command) type: {0}")]
    UnknownMessageType(i32),

    #[error("max retry exceeded")]
    MaxRetryExceeded,

    /// Downstream target has no live connection on this gateway.
    #[error("unknown receiver: biz_id={biz_id}, user_id={user_id}")]
    UnknownReceiver { biz_id: u64, user_id: u64 },

    #[error("failed to marshal message: {0}")]
    MarshalMessage(#[from] protocol::CodecError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Wire(#[from] wire::WireError),

    #[error(transparent)]
    Session(#[from] session::SessionError),

    #[error(transparent)]
    Broker(#[from] mq::MqError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
