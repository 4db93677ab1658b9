//! Wire-layer error types.

use thiserror::Error;

use crate::frame::CloseCode;

/// Wire-layer error type.
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent a close frame. Carries the close code so callers can
    /// distinguish a clean goodbye from an abnormal one.
    #[error("connection closed by peer: code {code}")]
    Closed {
        code: CloseCode,
        reason: String,
    },

    /// The stream ended without a close frame.
    #[error("unexpected end of stream")]
    Eof,

    /// The peer violated the framing protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A message exceeded the configured size limit.
    #[error("message too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    /// Compression or decompression failed.
    #[error("deflate error: {0}")]
    Deflate(String),

    /// The handshake request was not a valid WebSocket upgrade.
    #[error("bad handshake: {0}")]
    BadHandshake(String),
}

impl WireError {
    /// True when the peer closed without a status or is going away, i.e. the
    /// kinds of close a server should treat as a normal client departure.
    pub fn is_clean_close(&self) -> bool {
        matches!(
            self,
            WireError::Closed {
                code: CloseCode::NoStatusReceived | CloseCode::GoingAway,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
