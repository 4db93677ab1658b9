//! Handlers for messages the frontend sends up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use mq::{Producer, Record};
use protocol::{AckPayload, CommandType, Message};
use tracing::{debug, error};

use crate::conn::Connection;
use crate::error::Result;
use crate::push::PushFn;
use crate::retransmit::RetransmitManager;

/// One upstream message handler; the dispatcher routes by [`Self::cmd`].
#[async_trait]
pub trait UpstreamHandler: Send + Sync {
    fn cmd(&self) -> CommandType;

    async fn handle(&self, conn: &Arc<Connection>, msg: Message) -> Result<()>;
}

/// Echoes heartbeats back to the same connection (ping/pong).
pub struct HeartbeatHandler {
    push_fn: PushFn,
}

impl HeartbeatHandler {
    pub fn new(push_fn: PushFn) -> Self {
        Self { push_fn }
    }
}

#[async_trait]
impl UpstreamHandler for HeartbeatHandler {
    fn cmd(&self) -> CommandType {
        CommandType::Heartbeat
    }

    async fn handle(&self, conn: &Arc<Connection>, msg: Message) -> Result<()> {
        debug!(conn_id = conn.id(), "heartbeat received");
        conn.update_activity();
        (self.push_fn)(conn.clone(), msg).await
    }
}

/// Forwards business messages to the backend over the broker, then acks the
/// frontend either way.
pub struct FrontendMsgHandler {
    topic: String,
    on_receive_timeout: Duration,
    producer: Arc<dyn Producer>,
    push_fn: PushFn,
}

impl FrontendMsgHandler {
    pub fn new(
        topic: impl Into<String>,
        on_receive_timeout: Duration,
        producer: Arc<dyn Producer>,
        push_fn: PushFn,
    ) -> Self {
        Self {
            topic: topic.into(),
            on_receive_timeout,
            producer,
            push_fn,
        }
    }

    /// Publish the message to the backend topic, keyed by message id.
    async fn forward_to_backend(&self, msg: &Message) -> Result<()> {
        let value = serde_json::to_vec(msg)?;
        let record = Record::new(
            self.topic.clone(),
            msg.message_id.clone().into_bytes(),
            value,
        );

        let produced = tokio::time::timeout(self.on_receive_timeout, self.producer.produce(record))
            .await
            .map_err(|_| mq::MqError::Publish("produce timed out".to_string()))?;
        produced?;
        counter!("synp_upstream_forwarded_total").increment(1);
        Ok(())
    }
}

#[async_trait]
impl UpstreamHandler for FrontendMsgHandler {
    fn cmd(&self) -> CommandType {
        CommandType::Upstream
    }

    async fn handle(&self, conn: &Arc<Connection>, msg: Message) -> Result<()> {
        conn.update_activity();

        let mut ack = AckPayload {
            success: true,
            timestamp: Utc::now().timestamp_millis(),
            error_message: String::new(),
        };

        if let Err(err) = self.forward_to_backend(&msg).await {
            error!(
                conn_id = conn.id(),
                message_id = %msg.message_id,
                error = %err,
                "failed to forward message to backend"
            );
            ack.success = false;
            ack.error_message = err.to_string();
        }

        let body = serde_json::to_vec(&ack)?;
        (self.push_fn)(
            conn.clone(),
            Message::new(msg.message_id.clone(), CommandType::UpstreamAck, body),
        )
        .await
    }
}

/// Cancels the retransmit task the ack refers to.
pub struct DownstreamAckHandler {
    retransmit: Arc<RetransmitManager>,
}

impl DownstreamAckHandler {
    pub fn new(retransmit: Arc<RetransmitManager>) -> Self {
        Self { retransmit }
    }
}

#[async_trait]
impl UpstreamHandler for DownstreamAckHandler {
    fn cmd(&self) -> CommandType {
        CommandType::DownstreamAck
    }

    async fn handle(&self, conn: &Arc<Connection>, msg: Message) -> Result<()> {
        self.retransmit.stop(conn.id(), &msg.message_id);
        debug!(
            conn_id = conn.id(),
            message_id = %msg.message_id,
            "downstream ack received"
        );
        Ok(())
    }
}
