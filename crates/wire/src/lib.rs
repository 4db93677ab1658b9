//! WebSocket wire layer: framing, server handshake, and permessage-deflate.
//!
//! This crate owns everything between a raw byte stream and one complete
//! application message:
//!
//! - [`handshake`]: HTTP upgrade parsing/response, including negotiation of
//!   the permessage-deflate extension.
//! - [`frame`]: RFC 6455 frame encoding and decoding.
//! - [`deflate`]: RFC 7692 per-message compression state.
//! - [`WireReader`] / [`WireWriter`]: message-level read/write over split
//!   stream halves. Control frames are handled transparently; deadlines are
//!   applied by the caller around each call.

pub mod deflate;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod reader;
pub mod writer;

use tokio::io::{AsyncRead, AsyncWrite};

pub use deflate::{DeflateConfig, DeflateParams, DeflateState};
pub use error::{Result, WireError};
pub use frame::{CloseCode, OpCode};
pub use handshake::Request;
pub use reader::WireReader;
pub use writer::WireWriter;

/// Role of this end of the connection. Servers write unmasked frames and
/// accept masked ones; clients do the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Object-safe byte stream, so the gateway can run over TCP, Unix sockets,
/// or in-memory duplex pipes in tests.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A boxed byte stream.
pub type BoxedIo = Box<dyn Io>;
