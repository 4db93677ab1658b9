//! Message-level writer over a stream half.

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::deflate::{Deflater, DeflateState};
use crate::error::Result;
use crate::frame::{self, CloseCode, OpCode};
use crate::Role;

/// Writes one application message per call, deflating first when compression
/// was negotiated. Clients mask outgoing frames; servers do not.
pub struct WireWriter<W> {
    io: W,
    role: Role,
    deflater: Option<Deflater>,
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(io: W, role: Role, deflate: Option<DeflateState>) -> Self {
        Self {
            io,
            role,
            deflater: deflate.map(|state| Deflater::new(state.level, state.encoder_resets(role))),
            scratch: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Write one application message as a single binary frame.
    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        match &mut self.deflater {
            Some(deflater) => {
                let compressed = deflater.compress(payload)?;
                self.write_frame(OpCode::Binary, &compressed, true).await
            }
            None => self.write_frame(OpCode::Binary, payload, false).await,
        }
    }

    pub async fn write_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.write_frame(OpCode::Ping, payload, false).await
    }

    pub async fn write_pong(&mut self, payload: &[u8]) -> Result<()> {
        self.write_frame(OpCode::Pong, payload, false).await
    }

    pub async fn write_close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        let mut payload = code.as_u16().to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        self.write_frame(OpCode::Close, &payload, false).await
    }

    async fn write_frame(&mut self, opcode: OpCode, payload: &[u8], rsv1: bool) -> Result<()> {
        let mask = match self.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };
        self.scratch.clear();
        frame::encode(&mut self.scratch, true, rsv1, opcode, payload, mask);
        self.io.write_all(&self.scratch).await?;
        self.io.flush().await?;
        Ok(())
    }
}
