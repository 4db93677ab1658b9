//! One bidirectional frontend link.
//!
//! A `Connection` owns exactly two tasks: the send loop, which drains the
//! send channel onto the wire with a write deadline and timeout-only retry,
//! and the receive loop, which reads under a deadline, smooths bursts with a
//! leaky bucket, and forwards payloads to the receive channel. Both tasks
//! observe the connection's cancellation token; either one failing closes
//! the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge};
use session::{Session, User};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use wire::{BoxedIo, CloseCode, DeflateState, Role, WireReader, WireWriter};

use crate::error::{GatewayError, Result};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_SEND_BUFFER_SIZE: usize = 256;
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 256;

pub const DEFAULT_INIT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

pub const DEFAULT_RATE_LIMIT: u32 = 10;

/// Per-connection settings, derived from the connection manager's config.
#[derive(Debug, Clone)]
pub struct ConnOptions {
    pub read_timeout: Duration,
    pub write_timeout: Duration,

    pub init_retry_interval: Duration,
    pub max_retry_interval: Duration,
    pub max_retry_count: u32,

    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,

    /// Reads per second allowed from this client; 0 disables the limiter.
    pub rate_limit: u32,
    pub auto_close: bool,
    pub deflate: Option<DeflateState>,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            init_retry_interval: DEFAULT_INIT_RETRY_INTERVAL,
            max_retry_interval: DEFAULT_MAX_RETRY_INTERVAL,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            rate_limit: DEFAULT_RATE_LIMIT,
            auto_close: false,
            deflate: None,
        }
    }
}

/// Timeout-only retry schedule for writes: the interval doubles each attempt
/// up to a cap, for a bounded number of attempts.
pub(crate) struct ExponentialBackoff {
    next: Duration,
    init: Duration,
    max: Duration,
    remaining: u32,
    bounded: bool,
}

impl ExponentialBackoff {
    pub fn new(init: Duration, max: Duration, count: u32) -> Self {
        Self {
            next: init,
            init,
            max,
            remaining: count,
            bounded: true,
        }
    }

    /// A schedule that never exhausts, for loops that reset on success.
    pub fn unbounded(init: Duration, max: Duration) -> Self {
        Self {
            next: init,
            init,
            max,
            remaining: 0,
            bounded: false,
        }
    }

    pub fn next(&mut self) -> Option<Duration> {
        if self.bounded {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
        }
        let current = self.next;
        self.next = (self.next * 2).min(self.max);
        Some(current)
    }

    pub fn reset(&mut self) {
        self.next = self.init;
    }
}

/// Leaky bucket pacing reads: at most `rate` events per second, blocking to
/// smooth bursts rather than rejecting them.
struct LeakyBucket {
    period: Duration,
    next_at: Instant,
}

impl LeakyBucket {
    fn new(rate: u32) -> Self {
        Self {
            period: Duration::from_secs(1) / rate,
            next_at: Instant::now(),
        }
    }

    async fn take(&mut self) {
        let now = Instant::now();
        if self.next_at > now {
            tokio::time::sleep_until(self.next_at).await;
        }
        self.next_at = self.next_at.max(now) + self.period;
    }
}

/// One live frontend connection.
pub struct Connection {
    id: String,
    session: Session,
    send_tx: mpsc::Sender<Vec<u8>>,
    receive_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    activity: Mutex<Instant>,
    auto_close: bool,
    token: CancellationToken,
    close_once: AtomicBool,
}

impl Connection {
    /// Create the connection and start its send/receive loops.
    pub fn spawn(
        parent: &CancellationToken,
        id: String,
        session: Session,
        io: BoxedIo,
        opts: ConnOptions,
    ) -> Arc<Self> {
        let token = parent.child_token();
        let (read_half, write_half) = tokio::io::split(io);

        let (send_tx, send_rx) = mpsc::channel(opts.send_buffer_size.max(1));
        let (receive_tx, receive_rx) = mpsc::channel(opts.receive_buffer_size.max(1));
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();

        let reader = WireReader::new(read_half, Role::Server, opts.deflate, Some(pong_tx));
        let writer = WireWriter::new(write_half, Role::Server, opts.deflate);

        let conn = Arc::new(Self {
            id,
            session,
            send_tx,
            receive_rx: tokio::sync::Mutex::new(receive_rx),
            activity: Mutex::new(Instant::now()),
            auto_close: opts.auto_close,
            token,
            close_once: AtomicBool::new(false),
        });

        counter!("synp_connections_total").increment(1);
        gauge!("synp_active_connections").increment(1.0);

        tokio::spawn(send_loop(conn.clone(), writer, send_rx, pong_rx, opts.clone()));
        tokio::spawn(receive_loop(conn.clone(), reader, receive_tx, opts));

        conn
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn user(&self) -> &User {
        self.session.user()
    }

    /// Queue a payload for delivery. Blocks when the send buffer is full;
    /// fails once the connection is closed.
    pub async fn send(&self, payload: Vec<u8>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(GatewayError::ConnClosed);
        }
        tokio::select! {
            _ = self.token.cancelled() => Err(GatewayError::ConnClosed),
            sent = self.send_tx.send(payload) => sent.map_err(|_| GatewayError::ConnClosed),
        }
    }

    /// Next payload from the client. `None` once the receive loop has exited
    /// and the buffer is drained.
    pub async fn receive(&self) -> Option<Vec<u8>> {
        self.receive_rx.lock().await.recv().await
    }

    /// Mark the connection as recently active. No-op after close.
    pub fn update_activity(&self) {
        if !self.token.is_cancelled() {
            *self.activity.lock().unwrap() = Instant::now();
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self.activity.lock().unwrap()
    }

    pub fn auto_close(&self) -> bool {
        self.auto_close
    }

    /// Resolves when the connection reaches its terminal state.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Idempotent teardown: cancels both loops and, through them, the
    /// underlying stream. Safe to call from any task.
    pub fn close(&self) {
        if self.close_once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        gauge!("synp_active_connections").decrement(1.0);
        debug!(conn_id = %self.id, "connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn send_loop(
    conn: Arc<Connection>,
    mut writer: WireWriter<WriteHalf<BoxedIo>>,
    mut send_rx: mpsc::Receiver<Vec<u8>>,
    mut pong_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    opts: ConnOptions,
) {
    loop {
        tokio::select! {
            biased;

            _ = conn.token.cancelled() => break,

            // Pong replies to pings the reader saw; answered with priority.
            pong = pong_rx.recv() => match pong {
                Some(payload) => {
                    let write = timeout(opts.write_timeout, writer.write_pong(&payload)).await;
                    if !matches!(write, Ok(Ok(()))) {
                        error!(conn_id = %conn.id, "failed to answer ping");
                        break;
                    }
                }
                None => break,
            },

            payload = send_rx.recv() => match payload {
                Some(payload) => {
                    if !try_send(&conn, &mut writer, &payload, &opts).await {
                        break;
                    }
                    counter!("synp_messages_sent_total").increment(1);
                }
                None => break,
            },
        }
    }

    // Best-effort goodbye; the stream is dropped either way.
    let _ = timeout(
        Duration::from_secs(1),
        writer.write_close(CloseCode::Normal, ""),
    )
    .await;
    conn.close();
}

/// Write one payload, retrying timeouts with exponential backoff. Any other
/// error, or retry exhaustion, fails the send and thereby the connection.
async fn try_send(
    conn: &Arc<Connection>,
    writer: &mut WireWriter<WriteHalf<BoxedIo>>,
    payload: &[u8],
    opts: &ConnOptions,
) -> bool {
    let mut backoff = ExponentialBackoff::new(
        opts.init_retry_interval,
        opts.max_retry_interval,
        opts.max_retry_count,
    );

    loop {
        if conn.token.is_cancelled() {
            return false;
        }

        match timeout(opts.write_timeout, writer.write(payload)).await {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => {
                error!(
                    conn_id = %conn.id,
                    payload_len = payload.len(),
                    error = %err,
                    "failed to send message to client"
                );
                return false;
            }
            Err(_elapsed) => {
                error!(conn_id = %conn.id, "send to client timed out");
                let Some(delay) = backoff.next() else {
                    error!(conn_id = %conn.id, "resend reached max retry");
                    return false;
                };
                tokio::select! {
                    _ = conn.token.cancelled() => return false,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

async fn receive_loop(
    conn: Arc<Connection>,
    mut reader: WireReader<ReadHalf<BoxedIo>>,
    receive_tx: mpsc::Sender<Vec<u8>>,
    opts: ConnOptions,
) {
    let mut limiter = (opts.rate_limit > 0).then(|| LeakyBucket::new(opts.rate_limit));

    loop {
        if let Some(limiter) = limiter.as_mut() {
            tokio::select! {
                _ = conn.token.cancelled() => break,
                _ = limiter.take() => {}
            }
        }
        if conn.token.is_cancelled() {
            break;
        }

        let read = tokio::select! {
            _ = conn.token.cancelled() => break,
            read = timeout(opts.read_timeout, reader.read()) => read,
        };

        match read {
            // Read deadline passed with no traffic; idle is fine.
            Err(_elapsed) => continue,
            Ok(Ok(payload)) => {
                counter!("synp_messages_received_total").increment(1);
                tokio::select! {
                    _ = conn.token.cancelled() => break,
                    sent = receive_tx.send(payload) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(Err(err)) if err.is_clean_close() => {
                info!(conn_id = %conn.id, "client closed connection");
                break;
            }
            Ok(Err(err)) => {
                error!(conn_id = %conn.id, error = %err, "failed to read message from client");
                break;
            }
        }
    }

    drop(receive_tx);
    conn.close();
}
