//! Connection lifecycle events and upstream-message dispatch.
//!
//! `ConnEventHandler` is the gateway's event handler: it decodes frontend
//! payloads, deduplicates them against the KV store, and routes them to the
//! upstream handler registered for the command. The handler table is built
//! once at startup from the handlers' own `cmd()` declarations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use protocol::{Codec, CommandType, Message, PushMessage};
use session::KvStore;
use tracing::{debug, error, info, warn};

use crate::conn::Connection;
use crate::downstream::DownstreamHandler;
use crate::error::{GatewayError, Result};
use crate::upstream::UpstreamHandler;

pub const DEFAULT_CACHE_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_CACHE_EXPIRATION: Duration = Duration::from_secs(600);

/// Callbacks around a connection's life and traffic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_connect(&self, conn: &Arc<Connection>) -> Result<()>;

    async fn on_disconnect(&self, conn: &Arc<Connection>) -> Result<()>;

    /// A payload arrived from the frontend.
    async fn on_receive_from_frontend(&self, conn: &Arc<Connection>, payload: Vec<u8>)
        -> Result<()>;

    /// A push message arrived from the backend for these connections.
    async fn on_receive_from_backend(
        &self,
        conns: &[Arc<Connection>],
        push: PushMessage,
    ) -> Result<()>;
}

/// Runs several handlers in order. A rate-limited payload short-circuits the
/// rest of the chain without surfacing an error.
pub struct EventHandlerChain {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventHandlerChain {
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl EventHandler for EventHandlerChain {
    async fn on_connect(&self, conn: &Arc<Connection>) -> Result<()> {
        for handler in &self.handlers {
            handler.on_connect(conn).await?;
        }
        Ok(())
    }

    async fn on_disconnect(&self, conn: &Arc<Connection>) -> Result<()> {
        let mut first_err = Ok(());
        for handler in &self.handlers {
            if let Err(err) = handler.on_disconnect(conn).await {
                if first_err.is_ok() {
                    first_err = Err(err);
                }
            }
        }
        first_err
    }

    async fn on_receive_from_frontend(
        &self,
        conn: &Arc<Connection>,
        payload: Vec<u8>,
    ) -> Result<()> {
        let mut first_err = Ok(());
        for handler in &self.handlers {
            match handler.on_receive_from_frontend(conn, payload.clone()).await {
                Ok(()) => {}
                Err(GatewayError::RateLimited) => return Ok(()),
                Err(err) => {
                    if first_err.is_ok() {
                        first_err = Err(err);
                    }
                }
            }
        }
        first_err
    }

    async fn on_receive_from_backend(
        &self,
        conns: &[Arc<Connection>],
        push: PushMessage,
    ) -> Result<()> {
        let mut first_err = Ok(());
        for handler in &self.handlers {
            if let Err(err) = handler.on_receive_from_backend(conns, push.clone()).await {
                if first_err.is_ok() {
                    first_err = Err(err);
                }
            }
        }
        first_err
    }
}

/// The gateway's event handler: dedup, dispatch, downstream fan-out.
pub struct ConnEventHandler {
    kv: Arc<dyn KvStore>,
    cache_request_timeout: Duration,
    cache_expiration: Duration,
    codec: Codec,
    upstream: HashMap<CommandType, Arc<dyn UpstreamHandler>>,
    downstream: DownstreamHandler,
    retransmit: Arc<crate::retransmit::RetransmitManager>,
    manager: Arc<crate::manager::ConnManager>,
}

impl ConnEventHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Arc<dyn KvStore>,
        cache_request_timeout: Duration,
        cache_expiration: Duration,
        codec: Codec,
        upstream_handlers: Vec<Arc<dyn UpstreamHandler>>,
        downstream: DownstreamHandler,
        retransmit: Arc<crate::retransmit::RetransmitManager>,
        manager: Arc<crate::manager::ConnManager>,
    ) -> Self {
        let mut upstream = HashMap::new();
        for handler in upstream_handlers {
            upstream.insert(handler.cmd(), handler);
        }
        Self {
            kv,
            cache_request_timeout,
            cache_expiration,
            codec,
            upstream,
            downstream,
            retransmit,
            manager,
        }
    }

    fn decode_payload(&self, payload: &[u8]) -> Result<Message> {
        let msg: Message = self
            .codec
            .decode(payload)
            .map_err(|_| GatewayError::InvalidMessage("unknown message shape".to_string()))?;
        msg.validate().map_err(GatewayError::InvalidMessage)?;
        Ok(msg)
    }

    fn dedup_key(biz_id: u64, message_id: &str) -> String {
        format!("{biz_id}:{message_id}")
    }

    /// Assert uniqueness of `(biz, message_id)` within the dedup window.
    /// Returns false on a dedup hit. Heartbeats are never deduplicated.
    async fn cache_message(&self, biz_id: u64, msg: &Message) -> Result<bool> {
        if msg.command() == CommandType::Heartbeat {
            return Ok(true);
        }

        let key = Self::dedup_key(biz_id, &msg.message_id);
        let set = tokio::time::timeout(
            self.cache_request_timeout,
            self.kv.set_nx(&key, &msg.message_id, self.cache_expiration),
        )
        .await
        .map_err(|_| GatewayError::CacheMessage("kv request timed out".to_string()))?
        .map_err(|err| GatewayError::CacheMessage(err.to_string()))?;
        Ok(set)
    }

    /// Best-effort removal of the dedup entry, so the client's retry is not
    /// swallowed after a routing miss or retry exhaustion.
    async fn uncache_message(&self, biz_id: u64, msg: &Message) -> Result<()> {
        if msg.command() == CommandType::Heartbeat {
            return Ok(());
        }

        let key = Self::dedup_key(biz_id, &msg.message_id);
        tokio::time::timeout(self.cache_request_timeout, self.kv.del(&key))
            .await
            .map_err(|_| GatewayError::UncacheMessage("kv request timed out".to_string()))?
            .map_err(|err| GatewayError::UncacheMessage(err.to_string()))?;
        Ok(())
    }

    fn needs_uncache(err: &GatewayError) -> bool {
        matches!(
            err,
            GatewayError::UnknownMessageType(_) | GatewayError::MaxRetryExceeded
        )
    }
}

#[async_trait]
impl EventHandler for ConnEventHandler {
    async fn on_connect(&self, conn: &Arc<Connection>) -> Result<()> {
        debug!(conn_id = conn.id(), "connection connected");
        Ok(())
    }

    async fn on_disconnect(&self, conn: &Arc<Connection>) -> Result<()> {
        debug!(conn_id = conn.id(), "connection disconnected");
        self.retransmit.clear_by_conn(conn.id());

        // Destroy the session only when no other live connection of this
        // user remains; a preempting or sibling-device connection keeps it.
        let others_alive = self
            .manager
            .find_user_conn(conn.user())
            .map(|conns| {
                conns
                    .iter()
                    .any(|other| !Arc::ptr_eq(other, conn) && !other.is_closed())
            })
            .unwrap_or(false);
        if !others_alive {
            if let Err(err) = conn.session().destroy().await {
                warn!(conn_id = conn.id(), error = %err, "failed to destroy session on disconnect");
            }
        }

        conn.close();
        Ok(())
    }

    async fn on_receive_from_frontend(
        &self,
        conn: &Arc<Connection>,
        payload: Vec<u8>,
    ) -> Result<()> {
        let msg = self.decode_payload(&payload).map_err(|err| {
            error!(conn_id = conn.id(), error = %err, "failed to decode payload");
            err
        })?;

        let user = conn.user().clone();
        let fresh = self.cache_message(user.biz_id, &msg).await.map_err(|err| {
            error!(conn_id = conn.id(), error = %err, "failed to cache message");
            err
        })?;
        if !fresh {
            counter!("synp_dedup_hits_total").increment(1);
            warn!(
                conn_id = conn.id(),
                message_id = %msg.message_id,
                "message duplicated, ignore it"
            );
            return Err(GatewayError::MessageDuplicated);
        }

        info!(
            conn_id = conn.id(),
            message_id = %msg.message_id,
            cmd = msg.cmd,
            "received message from frontend"
        );

        let result = match self.upstream.get(&msg.command()) {
            None => {
                error!(
                    conn_id = conn.id(),
                    cmd = msg.cmd,
                    "unknown message type from frontend"
                );
                Err(GatewayError::UnknownMessageType(msg.cmd))
            }
            Some(handler) => handler.handle(conn, msg.clone()).await,
        };

        if let Err(err) = &result {
            if Self::needs_uncache(err) {
                if let Err(uncache_err) = self.uncache_message(user.biz_id, &msg).await {
                    error!(
                        conn_id = conn.id(),
                        message_id = %msg.message_id,
                        error = %uncache_err,
                        "failed to uncache message"
                    );
                }
            }
        }
        result
    }

    async fn on_receive_from_backend(
        &self,
        conns: &[Arc<Connection>],
        push: PushMessage,
    ) -> Result<()> {
        push.validate().map_err(GatewayError::InvalidMessage)?;
        self.downstream.handle(conns, &push).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnOptions, Connection};
    use crate::push::codec_push_fn;
    use crate::retransmit::RetransmitManager;
    use session::{Device, MemoryStore, SessionStore, User};
    use tokio_util::sync::CancellationToken;

    struct RecordingHandler {
        cmd: CommandType,
        calls: std::sync::atomic::AtomicUsize,
        fail_with: Option<fn() -> GatewayError>,
    }

    #[async_trait]
    impl UpstreamHandler for RecordingHandler {
        fn cmd(&self) -> CommandType {
            self.cmd
        }

        async fn handle(&self, _conn: &Arc<Connection>, _msg: Message) -> Result<()> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    struct Fixture {
        handler: ConnEventHandler,
        kv: Arc<MemoryStore>,
        conn: Arc<Connection>,
        upstream: Arc<RecordingHandler>,
        _io: tokio::io::DuplexStream,
    }

    async fn fixture(fail_with: Option<fn() -> GatewayError>) -> Fixture {
        let kv = Arc::new(MemoryStore::new());
        let store: Arc<dyn KvStore> = kv.clone();
        let codec = Codec::Json;
        let push_fn = codec_push_fn(codec);
        let retransmit = RetransmitManager::new(Duration::from_secs(8), 3, push_fn.clone());
        let manager = Arc::new(crate::manager::ConnManager::new(
            crate::manager::ConnManagerConfig::default(),
        ));

        let upstream = Arc::new(RecordingHandler {
            cmd: CommandType::Upstream,
            calls: std::sync::atomic::AtomicUsize::new(0),
            fail_with,
        });

        let handler = ConnEventHandler::new(
            store.clone(),
            Duration::from_secs(1),
            Duration::from_secs(60),
            codec,
            vec![upstream.clone() as Arc<dyn UpstreamHandler>],
            DownstreamHandler::new(push_fn, retransmit.clone()),
            retransmit,
            manager,
        );

        let user = User {
            biz_id: 1,
            user_id: 42,
            device: Device::Mobile,
            auto_close: false,
        };
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (session, _) = SessionStore::new(store).build(&user).await.unwrap();
        let conn = Connection::spawn(
            &CancellationToken::new(),
            user.conn_id(),
            session,
            Box::new(server),
            ConnOptions::default(),
        );

        Fixture {
            handler,
            kv,
            conn,
            upstream,
            _io: client,
        }
    }

    fn upstream_payload(id: &str) -> Vec<u8> {
        Codec::Json
            .encode(&Message::new(id, CommandType::Upstream, b"b".to_vec()))
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_payload_is_rejected_before_the_handler() {
        let fx = fixture(None).await;
        let payload = upstream_payload("m1");

        fx.handler
            .on_receive_from_frontend(&fx.conn, payload.clone())
            .await
            .unwrap();
        let second = fx
            .handler
            .on_receive_from_frontend(&fx.conn, payload)
            .await;
        assert!(matches!(second, Err(GatewayError::MessageDuplicated)));
        assert_eq!(
            fx.upstream.calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn routing_miss_reverts_the_dedup_entry() {
        let fx = fixture(None).await;
        let payload = Codec::Json
            .encode(&Message::new(
                "m2",
                CommandType::DownstreamAck,
                Vec::new(),
            ))
            .unwrap();

        // No handler registered for DOWNSTREAM_ACK in this fixture: routing
        // misses and the dedup entry is removed, so a retry is not swallowed
        // as a duplicate.
        let first = fx
            .handler
            .on_receive_from_frontend(&fx.conn, payload.clone())
            .await;
        assert!(matches!(first, Err(GatewayError::UnknownMessageType(_))));
        assert_eq!(fx.kv.string_key_count(), 0);

        let retry = fx.handler.on_receive_from_frontend(&fx.conn, payload).await;
        assert!(matches!(retry, Err(GatewayError::UnknownMessageType(_))));
    }

    #[tokio::test]
    async fn handler_failure_keeps_the_dedup_entry() {
        let fx = fixture(Some(|| GatewayError::ConnClosed)).await;
        let payload = upstream_payload("m3");

        let first = fx
            .handler
            .on_receive_from_frontend(&fx.conn, payload.clone())
            .await;
        assert!(matches!(first, Err(GatewayError::ConnClosed)));
        // Non-reverting failure: the retry is treated as a duplicate.
        let retry = fx.handler.on_receive_from_frontend(&fx.conn, payload).await;
        assert!(matches!(retry, Err(GatewayError::MessageDuplicated)));
        assert_eq!(
            fx.upstream.calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn heartbeats_bypass_dedup() {
        let fx = fixture(None).await;
        let payload = Codec::Json
            .encode(&Message::new("", CommandType::Heartbeat, Vec::new()))
            .unwrap();

        // Without a heartbeat handler registered this is a routing miss, but
        // dedup never sees it: both attempts reach routing.
        let first = fx
            .handler
            .on_receive_from_frontend(&fx.conn, payload.clone())
            .await;
        let second = fx.handler.on_receive_from_frontend(&fx.conn, payload).await;
        assert!(matches!(first, Err(GatewayError::UnknownMessageType(_))));
        assert!(matches!(second, Err(GatewayError::UnknownMessageType(_))));
        assert_eq!(fx.kv.string_key_count(), 0);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected() {
        let fx = fixture(None).await;

        let garbage = fx
            .handler
            .on_receive_from_frontend(&fx.conn, b"not json".to_vec())
            .await;
        assert!(matches!(garbage, Err(GatewayError::InvalidMessage(_))));

        // Non-heartbeat with an empty message id.
        let missing_id = Codec::Json
            .encode(&Message::new("", CommandType::Upstream, Vec::new()))
            .unwrap();
        let result = fx
            .handler
            .on_receive_from_frontend(&fx.conn, missing_id)
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidMessage(_))));
    }
}
