//! Message-level reader over a stream half.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::trace;

use crate::deflate::{DeflateState, Inflater};
use crate::error::{Result, WireError};
use crate::frame::{self, Frame, OpCode};
use crate::Role;

/// Default cap on a single application message, compressed or not.
pub const DEFAULT_MAX_PAYLOAD: usize = 1 << 20;

/// Reads one complete application message at a time, reassembling fragments,
/// inflating compressed messages, and handling control frames transparently.
///
/// Ping payloads are forwarded to `pong_tx`; whoever owns the write half is
/// expected to answer them. A close frame surfaces as [`WireError::Closed`].
///
/// `read` is cancel-safe: frame reassembly state lives on the struct, so a
/// caller-imposed deadline that fires between reads loses nothing.
pub struct WireReader<R> {
    io: R,
    buf: BytesMut,
    max_payload: usize,
    inflater: Option<Inflater>,
    pong_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Partially assembled fragmented message: (compressed, bytes so far).
    partial: Option<(bool, Vec<u8>)>,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(
        io: R,
        role: Role,
        deflate: Option<DeflateState>,
        pong_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    ) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4 * 1024),
            max_payload: DEFAULT_MAX_PAYLOAD,
            inflater: deflate.map(|state| Inflater::new(state.decoder_resets(role))),
            pong_tx,
            partial: None,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Read the next application message.
    pub async fn read(&mut self) -> Result<Vec<u8>> {
        loop {
            let frame = self.next_frame().await?;

            if frame.opcode.is_control() {
                self.handle_control(frame)?;
                continue;
            }

            match (&mut self.partial, frame.opcode) {
                (None, OpCode::Text | OpCode::Binary) => {
                    if frame.rsv1 && self.inflater.is_none() {
                        return Err(WireError::Protocol(
                            "compressed frame without negotiated extension".into(),
                        ));
                    }
                    self.partial = Some((frame.rsv1, frame.payload));
                }
                (None, OpCode::Continuation) => {
                    return Err(WireError::Protocol("unexpected continuation frame".into()));
                }
                (Some((_, assembled)), OpCode::Continuation) => {
                    if assembled.len() + frame.payload.len() > self.max_payload {
                        return Err(WireError::TooLarge {
                            size: assembled.len() + frame.payload.len(),
                            limit: self.max_payload,
                        });
                    }
                    assembled.extend_from_slice(&frame.payload);
                }
                (Some(_), _) => {
                    return Err(WireError::Protocol(
                        "data frame interleaved with fragmented message".into(),
                    ));
                }
                (None, OpCode::Close | OpCode::Ping | OpCode::Pong) => {
                    unreachable!("control opcodes are handled above and never reach this match")
                }
            }

            if frame.fin {
                let (compressed, data) = self.partial.take().expect("partial message present");
                if compressed {
                    let inflater = self.inflater.as_mut().expect("checked above");
                    return inflater.decompress(&data, self.max_payload);
                }
                return Ok(data);
            }
        }
    }

    fn handle_control(&mut self, frame: Frame) -> Result<()> {
        match frame.opcode {
            OpCode::Ping => {
                trace!(len = frame.payload.len(), "ping received");
                if let Some(tx) = &self.pong_tx {
                    let _ = tx.send(frame.payload);
                }
                Ok(())
            }
            OpCode::Pong => Ok(()),
            OpCode::Close => {
                let (code, reason) = frame.close_info();
                Err(WireError::Closed { code, reason })
            }
            _ => unreachable!("non-control opcode in handle_control"),
        }
    }

    async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = frame::decode(&mut self.buf, self.max_payload)? {
                return Ok(frame);
            }
            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(WireError::Eof);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflate::DeflateParams;
    use crate::writer::WireWriter;
    use crate::frame::CloseCode;

    fn deflate_state() -> DeflateState {
        DeflateState {
            params: DeflateParams {
                server_no_context_takeover: false,
                client_no_context_takeover: false,
            },
            level: 6,
        }
    }

    #[tokio::test]
    async fn plain_roundtrip() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (crx, ctx) = tokio::io::split(client);
        let (srx, _stx) = tokio::io::split(server);
        drop(crx);

        let mut writer = WireWriter::new(ctx, Role::Client, None);
        let mut reader = WireReader::new(srx, Role::Server, None, None);

        writer.write(b"one").await.unwrap();
        writer.write(b"two").await.unwrap();
        assert_eq!(reader.read().await.unwrap(), b"one");
        assert_eq!(reader.read().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn compressed_roundtrip() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (_crx, ctx) = tokio::io::split(client);
        let (srx, _stx) = tokio::io::split(server);

        let state = deflate_state();
        let mut writer = WireWriter::new(ctx, Role::Client, Some(state));
        let mut reader = WireReader::new(srx, Role::Server, Some(state), None);

        let msg = b"compressed compressed compressed message".repeat(20);
        writer.write(&msg).await.unwrap();
        writer.write(&msg).await.unwrap();
        assert_eq!(reader.read().await.unwrap(), msg);
        assert_eq!(reader.read().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn fragmented_message_reassembled() {
        use bytes::BytesMut;

        let (client, server) = tokio::io::duplex(16 * 1024);
        let (_crx, mut ctx) = tokio::io::split(client);
        let (srx, _stx) = tokio::io::split(server);

        let mut buf = BytesMut::new();
        frame::encode(&mut buf, false, false, OpCode::Binary, b"hello ", None);
        frame::encode(&mut buf, false, false, OpCode::Continuation, b"fragmented ", None);
        frame::encode(&mut buf, true, false, OpCode::Continuation, b"world", None);
        tokio::io::AsyncWriteExt::write_all(&mut ctx, &buf).await.unwrap();

        let mut reader = WireReader::new(srx, Role::Server, None, None);
        assert_eq!(reader.read().await.unwrap(), b"hello fragmented world");
    }

    #[tokio::test]
    async fn ping_forwarded_to_pong_channel() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (_crx, ctx) = tokio::io::split(client);
        let (srx, _stx) = tokio::io::split(server);

        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
        let mut writer = WireWriter::new(ctx, Role::Client, None);
        let mut reader = WireReader::new(srx, Role::Server, None, Some(pong_tx));

        writer.write_ping(b"are you there").await.unwrap();
        writer.write(b"payload").await.unwrap();

        assert_eq!(reader.read().await.unwrap(), b"payload");
        assert_eq!(pong_rx.recv().await.unwrap(), b"are you there");
    }

    #[tokio::test]
    async fn close_frame_surfaces_typed_error() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (_crx, ctx) = tokio::io::split(client);
        let (srx, _stx) = tokio::io::split(server);

        let mut writer = WireWriter::new(ctx, Role::Client, None);
        let mut reader = WireReader::new(srx, Role::Server, None, None);

        writer.write_close(CloseCode::GoingAway, "bye").await.unwrap();
        let err = reader.read().await.unwrap_err();
        assert!(err.is_clean_close());
    }

    #[tokio::test]
    async fn eof_surfaces_typed_error() {
        let (client, server) = tokio::io::duplex(1024);
        let (srx, _stx) = tokio::io::split(server);
        drop(client);

        let mut reader = WireReader::new(srx, Role::Server, None, None);
        assert!(matches!(reader.read().await, Err(WireError::Eof)));
    }
}
