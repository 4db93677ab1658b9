//! NATS JetStream implementation of the broker interfaces.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull, stream::Stream};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use crate::error::{MqError, Result};
use crate::record::{Consumer, ConsumerFactory, Producer, Record};

/// Default retention for gateway streams (5 minutes).
pub const DEFAULT_RETENTION_SECS: u64 = 300;

/// Default max messages per stream.
pub const DEFAULT_MAX_MESSAGES: i64 = 1_000_000;

/// Default max bytes per stream (1GB).
pub const DEFAULT_MAX_BYTES: i64 = 1_073_741_824;

/// Header carrying the record key; doubles as the JetStream dedup id when
/// idempotent publish is on.
const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Connection and stream settings.
#[derive(Debug, Clone)]
pub struct JetStreamConfig {
    pub url: String,
    /// Path to a credentials file; unset means anonymous auth.
    pub credentials_path: Option<String>,
    pub tls_required: bool,
    /// When set, publishes carry the record key as a dedup id and wait for
    /// the stream acknowledgement.
    pub idempotent_publish: bool,
    pub retention_secs: u64,
    pub max_messages: i64,
    pub max_bytes: i64,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            credentials_path: None,
            tls_required: false,
            idempotent_publish: true,
            retention_secs: DEFAULT_RETENTION_SECS,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Wrapper around the NATS client with a JetStream context.
#[derive(Clone)]
pub struct JetStreamClient {
    jetstream: jetstream::Context,
    config: JetStreamConfig,
}

impl JetStreamClient {
    /// Connect to the broker and create a JetStream context.
    pub async fn connect(config: JetStreamConfig) -> Result<Self> {
        info!(url = %config.url, "connecting to broker");

        let mut options = async_nats::ConnectOptions::new().require_tls(config.tls_required);
        if let Some(path) = &config.credentials_path {
            options = options
                .credentials_file(path)
                .await
                .map_err(|e| MqError::Connect(e.to_string()))?;
        }

        let client = options
            .connect(&config.url)
            .await
            .map_err(|e| MqError::Connect(e.to_string()))?;
        let jetstream = jetstream::new(client);

        Ok(Self { jetstream, config })
    }

    /// Create or look up the stream backing a topic.
    pub async fn ensure_stream(&self, topic: &str) -> Result<Stream> {
        let name = stream_name(topic);
        debug!(%name, %topic, "ensuring stream");

        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name,
                subjects: vec![topic.to_string()],
                retention: jetstream::stream::RetentionPolicy::Limits,
                max_messages: self.config.max_messages,
                max_bytes: self.config.max_bytes,
                max_age: Duration::from_secs(self.config.retention_secs),
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| MqError::Stream(e.to_string()))
    }

    /// A producer sharing this client's connection.
    pub fn producer(&self) -> JetStreamProducer {
        JetStreamProducer {
            jetstream: self.jetstream.clone(),
            idempotent: self.config.idempotent_publish,
        }
    }
}

/// Acked publisher over a JetStream context.
#[derive(Clone)]
pub struct JetStreamProducer {
    jetstream: jetstream::Context,
    idempotent: bool,
}

#[async_trait]
impl Producer for JetStreamProducer {
    async fn produce(&self, record: Record) -> Result<()> {
        let subject = record.topic.clone();
        let payload = bytes::Bytes::from(record.value);

        let ack = if self.idempotent && !record.key.is_empty() {
            let mut headers = async_nats::HeaderMap::new();
            headers.insert(MSG_ID_HEADER, String::from_utf8_lossy(&record.key).as_ref());
            self.jetstream
                .publish_with_headers(subject, headers, payload)
                .await
        } else {
            self.jetstream.publish(subject, payload).await
        }
        .map_err(|e| MqError::Publish(e.to_string()))?;

        // Wait for the stream acknowledgement; publish is not fire-and-forget.
        ack.await.map_err(|e| MqError::Publish(e.to_string()))?;
        Ok(())
    }
}

/// Creates durable pull consumers; the durable name is the consumer group.
pub struct JetStreamConsumerFactory {
    client: JetStreamClient,
}

impl JetStreamConsumerFactory {
    pub fn new(client: JetStreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConsumerFactory for JetStreamConsumerFactory {
    async fn consumer(&self, topic: &str, group_id: &str) -> Result<Box<dyn Consumer>> {
        let stream = self.client.ensure_stream(topic).await?;

        let durable = stream_name(group_id).to_lowercase();
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MqError::Stream(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| MqError::Consume(e.to_string()))?;

        debug!(%topic, %group_id, "created durable pull consumer");
        Ok(Box::new(JetStreamConsumer { messages }))
    }
}

/// One pull-consumer handle. `next` acks each delivered record, i.e. commits
/// the offset after the read.
pub struct JetStreamConsumer {
    messages: pull::Stream,
}

#[async_trait]
impl Consumer for JetStreamConsumer {
    async fn next(&mut self) -> Result<Record> {
        let message = match self.messages.next().await {
            None => return Err(MqError::Closed),
            Some(Err(e)) => return Err(MqError::Consume(e.to_string())),
            Some(Ok(message)) => message,
        };

        let key = message
            .headers
            .as_ref()
            .and_then(|headers| headers.get(MSG_ID_HEADER))
            .map(|value| value.as_str().as_bytes().to_vec())
            .unwrap_or_default();

        let record = Record {
            topic: message.subject.to_string(),
            key,
            value: message.payload.to_vec(),
        };

        message
            .ack()
            .await
            .map_err(|e| MqError::Consume(e.to_string()))?;
        Ok(record)
    }
}

/// Stream names allow fewer characters than subjects; normalize the topic.
fn stream_name(topic: &str) -> String {
    topic
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_name_normalization() {
        assert_eq!(stream_name("gateway.push-message"), "GATEWAY_PUSH_MESSAGE");
        assert_eq!(stream_name("frontend_upstream"), "FRONTEND_UPSTREAM");
    }
}
