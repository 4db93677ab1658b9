//! The push function: encode a message with the connection codec and hand it
//! to the connection's send path. Shared by the downstream handler, the
//! heartbeat echo, and the retransmit manager.

use std::sync::Arc;

use futures::future::BoxFuture;
use protocol::{Codec, Message};
use tracing::error;

use crate::conn::Connection;
use crate::error::Result;

/// Pushes one structured message to one connection.
pub type PushFn = Arc<dyn Fn(Arc<Connection>, Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Standard push function over a codec.
pub fn codec_push_fn(codec: Codec) -> PushFn {
    Arc::new(move |conn, msg| {
        Box::pin(async move {
            let payload = codec.encode(&msg).map_err(|err| {
                error!(
                    codec_name = codec.name(),
                    message_id = %msg.message_id,
                    error = %err,
                    "failed to marshal message"
                );
                err
            })?;

            conn.send(payload).await.map_err(|err| {
                error!(conn_id = conn.id(), error = %err, "failed to send message");
                err
            })
        })
    })
}
