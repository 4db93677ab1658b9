//! Backend push fan-out to a user's connections.

use std::sync::Arc;

use metrics::counter;
use protocol::{CommandType, Message, PushMessage};

use crate::conn::Connection;
use crate::error::Result;
use crate::push::PushFn;
use crate::retransmit::RetransmitManager;

/// Delivers one backend push to every given connection and arms a retransmit
/// task per connection.
pub struct DownstreamHandler {
    push_fn: PushFn,
    retransmit: Arc<RetransmitManager>,
}

impl DownstreamHandler {
    pub fn new(push_fn: PushFn, retransmit: Arc<RetransmitManager>) -> Self {
        Self {
            push_fn,
            retransmit,
        }
    }

    pub async fn handle(&self, conns: &[Arc<Connection>], push: &PushMessage) -> Result<()> {
        let msg = Message::new(
            push.message_id.clone(),
            CommandType::Downstream,
            push.body.clone(),
        );

        let mut result = Ok(());
        for conn in conns {
            match (self.push_fn)(conn.clone(), msg.clone()).await {
                Ok(()) => {
                    conn.update_activity();
                    counter!("synp_push_delivered_total").increment(1);
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }

        // Retransmit is armed for every connection regardless of the initial
        // push outcome; the ack (or retry exhaustion) retires each task.
        self.retransmit.start(conns, &msg);
        result
    }
}
