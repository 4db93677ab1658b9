//! Accept loop, admission control, per-connection event loop, and the
//! broker-consumer fan-in that routes backend pushes to connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use mq::Record;
use protocol::PushMessage;
use session::{Device, User};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wire::BoxedIo;

use crate::conn::ExponentialBackoff;
use crate::error::{GatewayError, Result};
use crate::handler::EventHandler;
use crate::limiter::TokenBucket;
use crate::manager::ConnManager;
use crate::consumer::BrokerConsumer;
use crate::upgrader::Upgrader;

/// Consumer key whose records are backend push messages.
pub const EVENT_PUSH_MESSAGE: &str = "gateway.push-message";

const ACCEPT_BACKOFF_INIT: Duration = Duration::from_millis(500);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Listen address settings. `network = "unix"` treats `host` as a socket
/// path; everything else binds TCP on `host:port`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub network: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 17001,
            network: "tcp".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        if self.network == "unix" {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    async fn bind(cfg: &ServerConfig) -> std::io::Result<Self> {
        match cfg.network.as_str() {
            #[cfg(unix)]
            "unix" => Ok(Listener::Unix(UnixListener::bind(&cfg.host)?)),
            _ => Ok(Listener::Tcp(TcpListener::bind(cfg.address()).await?)),
        }
    }

    async fn accept(&self) -> std::io::Result<BoxedIo> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }
}

/// Gives the admission token back when the connection task ends, whatever
/// path it takes out.
struct ReleaseGuard(Arc<TokenBucket>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// The gateway server.
pub struct Server {
    cfg: ServerConfig,
    upgrader: Arc<Upgrader>,
    manager: Arc<ConnManager>,
    handler: Arc<dyn EventHandler>,
    consumers: HashMap<String, BrokerConsumer>,
    limiter: Arc<TokenBucket>,
    accept_new_conn: AtomicBool,
    accept_token: CancellationToken,
    token: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

impl Server {
    pub fn new(
        cfg: ServerConfig,
        upgrader: Arc<Upgrader>,
        manager: Arc<ConnManager>,
        handler: Arc<dyn EventHandler>,
        consumers: HashMap<String, BrokerConsumer>,
        limiter: Arc<TokenBucket>,
    ) -> Arc<Self> {
        let token = CancellationToken::new();
        Arc::new(Self {
            cfg,
            upgrader,
            manager,
            handler,
            consumers,
            limiter,
            accept_new_conn: AtomicBool::new(true),
            accept_token: token.child_token(),
            token,
            local_addr: OnceLock::new(),
        })
    }

    /// Root cancellation token; child tokens propagate shutdown to every
    /// connection and consumer.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Address actually bound, once `start` has run. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bind the listener, start the accept loop and the configured broker
    /// consumers.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = Listener::bind(&self.cfg).await?;
        if let Some(addr) = listener.local_addr() {
            let _ = self.local_addr.set(addr);
        }
        info!(address = %self.cfg.address(), network = %self.cfg.network, "gateway listening");

        let server = self.clone();
        tokio::spawn(async move { server.accept_loop(listener).await });

        for (event, consumer) in &self.consumers {
            match event.as_str() {
                EVENT_PUSH_MESSAGE => {
                    let server = self.clone();
                    consumer
                        .start(
                            self.token.clone(),
                            Arc::new(move |record| {
                                let server = server.clone();
                                async move { server.consume_push_message(record).await }.boxed()
                            }),
                        )
                        .await
                        .map_err(|err| {
                            error!(error = %err, "failed to start push message consumer");
                            err
                        })?;
                }
                other => warn!(event = other, "no consume function for event"),
            }
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        let mut backoff = ExponentialBackoff::unbounded(ACCEPT_BACKOFF_INIT, ACCEPT_BACKOFF_MAX);

        loop {
            if !self.accept_new_conn.load(Ordering::Acquire) {
                info!("server is not accepting new connections");
                return;
            }

            // Admission first: take a token before accepting the socket.
            if !self.limiter.acquire() {
                let delay = backoff.next().expect("unbounded backoff");
                counter!("synp_accept_rejected_total").increment(1);
                warn!(next_backoff = ?delay, "connection limit reached, deferring accept");
                tokio::select! {
                    _ = self.accept_token.cancelled() => return,
                    _ = sleep(delay) => {}
                }
                continue;
            }
            backoff.reset();

            let io = tokio::select! {
                _ = self.accept_token.cancelled() => {
                    self.limiter.release();
                    info!("accept loop stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(io) => io,
                    Err(err) => {
                        self.limiter.release();
                        error!(error = %err, "failed to accept connection");
                        // Timeouts, resets, fd pressure: never crash the loop.
                        continue;
                    }
                }
            };

            let server = self.clone();
            tokio::spawn(async move { server.handle_conn(io).await });
        }
    }

    async fn handle_conn(self: Arc<Self>, mut io: BoxedIo) {
        let _release = ReleaseGuard(self.limiter.clone());

        let (session, deflate) = match self.upgrader.upgrade(&mut io).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                error!(error = %err, "failed to upgrade connection");
                return;
            }
        };

        let conn = match self.manager.new_conn(&self.token, io, session, deflate) {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = %err, "failed to create connection");
                return;
            }
        };
        let user = conn.user().clone();

        if let Err(err) = self.handler.on_connect(&conn).await {
            error!(conn_id = conn.id(), error = %err, "on connect failed");
            self.manager.remove_conn_exact(&user, &conn);
            conn.close();
            return;
        }

        loop {
            tokio::select! {
                payload = conn.receive() => match payload {
                    None => break,
                    Some(payload) => {
                        if let Err(err) = self.handler.on_receive_from_frontend(&conn, payload).await {
                            error!(conn_id = conn.id(), error = %err, "failed to handle frontend message");
                            if matches!(err, GatewayError::ConnClosed) {
                                break;
                            }
                        }
                    }
                },
                _ = conn.closed() => {
                    info!(conn_id = conn.id(), "connection has been closed");
                    break;
                }
                _ = self.token.cancelled() => {
                    info!(conn_id = conn.id(), "server has been closed");
                    break;
                }
            }
        }

        if let Err(err) = self.handler.on_disconnect(&conn).await {
            error!(conn_id = conn.id(), error = %err, "on disconnect failed");
        }
        self.manager.remove_conn_exact(&user, &conn);
        conn.close();
    }

    /// Route one backend push record to the matching connections.
    pub async fn consume_push_message(&self, record: Record) -> Result<()> {
        let push: PushMessage = serde_json::from_slice(&record.value).map_err(|err| {
            error!(error = %err, "failed to decode push message");
            GatewayError::Json(err)
        })?;

        let receiver = User {
            biz_id: push.biz_id,
            user_id: push.receiver_id,
            device: Device::Unknown,
            auto_close: false,
        };
        let Some(conns) = self.manager.find_user_conn(&receiver) else {
            counter!("synp_push_unroutable_total").increment(1);
            return Err(GatewayError::UnknownReceiver {
                biz_id: push.biz_id,
                user_id: push.receiver_id,
            });
        };

        counter!("synp_push_routed_total").increment(1);
        self.handler.on_receive_from_backend(&conns, push).await
    }

    /// Immediate shutdown: stop consumers, close the admission bucket, and
    /// cancel the server context, which propagates to every connection.
    pub fn shutdown(&self) {
        for consumer in self.consumers.values() {
            consumer.stop();
        }
        self.limiter.close();
        self.token.cancel();
        info!("server shut down");
    }

    /// Stop accepting, wait for live connections to drain (bounded by
    /// `close_timeout`), then shut down.
    pub async fn graceful_shutdown(&self, close_timeout: Duration) {
        self.accept_new_conn.store(false, Ordering::Release);
        self.accept_token.cancel();
        info!("graceful shutdown: no longer accepting connections");

        let deadline = tokio::time::Instant::now() + close_timeout;
        while self.manager.conn_count() > 0 && tokio::time::Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.manager.conn_count();
        if remaining > 0 {
            warn!(remaining, "graceful drain timed out, forcing shutdown");
        }
        self.shutdown();

        // Shutdown cancels every connection; wait for their handlers to
        // deregister so no live connection outlasts this call.
        let deadline = tokio::time::Instant::now() + close_timeout;
        while self.manager.conn_count() > 0 && tokio::time::Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
    }
}
