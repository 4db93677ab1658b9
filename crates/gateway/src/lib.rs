//! Real-time WebSocket gateway between frontends and the backend service
//! bus.
//!
//! ## Architecture
//!
//! ```text
//! frontend ──ws──▶ Server ──▶ Connection.receive ──▶ ConnEventHandler
//!                                                        │ dedup + route
//!                                      heartbeat / upstream / downstream-ack
//!                                                        │
//!                                                 broker producer ──▶ backend
//!
//! backend ──broker──▶ BrokerConsumer ──▶ Server ──▶ ConnManager.find_user_conn
//!                                              └──▶ DownstreamHandler ──▶ Connection.send
//!                                                        │
//!                                                 RetransmitManager (ack-cancelled timers)
//! ```
//!
//! Admission is a token bucket consulted before `accept()`; per-connection
//! backpressure comes from bounded send/receive channels and a leaky-bucket
//! read limiter.

pub mod app;
pub mod config;
pub mod conn;
pub mod consumer;
pub mod downstream;
pub mod error;
pub mod handler;
pub mod limiter;
pub mod manager;
pub mod push;
pub mod retransmit;
pub mod server;
pub mod upgrader;
pub mod upstream;

pub use app::App;
pub use config::Config;
pub use conn::{ConnOptions, Connection};
pub use consumer::BrokerConsumer;
pub use downstream::DownstreamHandler;
pub use error::{GatewayError, Result};
pub use handler::{ConnEventHandler, EventHandler, EventHandlerChain};
pub use limiter::{TokenBucket, TokenBucketConfig};
pub use manager::{ConnManager, ConnManagerConfig};
pub use push::{codec_push_fn, PushFn};
pub use retransmit::RetransmitManager;
pub use server::{Server, ServerConfig, EVENT_PUSH_MESSAGE};
pub use upgrader::Upgrader;
pub use upstream::{DownstreamAckHandler, FrontendMsgHandler, HeartbeatHandler, UpstreamHandler};
