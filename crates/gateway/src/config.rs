//! Typed configuration tree, loaded from a single YAML file.
//!
//! Every section has defaults in one place (its `Default` impl); the file
//! only overrides what it mentions. Durations are expressed in milliseconds
//! with `_ms`-suffixed keys.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::conn;
use crate::error::{GatewayError, Result};
use crate::handler;
use crate::limiter::TokenBucketConfig;
use crate::manager::{self, ConnManagerConfig};
use crate::retransmit;
use crate::server::ServerConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub codec: CodecSection,
    pub upgrader: UpgraderSection,
    pub conn: ConnSection,
    pub retransmit: RetransmitSection,
    pub handler: HandlerSection,
    pub consumer: ConsumerSection,
    pub limiter: LimiterSection,
    pub jwt: JwtSection,
    pub redis: RedisSection,
    pub nats: NatsSection,
    pub metrics: MetricsSection,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            GatewayError::Config(format!(
                "failed to read {}: {err}",
                path.as_ref().display()
            ))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|err| GatewayError::Config(format!("failed to parse config: {err}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub network: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        let cfg = ServerConfig::default();
        Self {
            host: cfg.host,
            port: cfg.port,
            network: cfg.network,
        }
    }
}

impl ServerSection {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            network: self.network.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodecSection {
    #[serde(rename = "type")]
    pub codec_type: String,
}

impl Default for CodecSection {
    fn default() -> Self {
        Self {
            codec_type: "json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpgraderSection {
    pub enabled: bool,
    pub server_max_window_bits: u8,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: u8,
    pub client_no_context_takeover: bool,
    pub level: u32,
}

impl Default for UpgraderSection {
    fn default() -> Self {
        let cfg = wire::DeflateConfig::default();
        Self {
            enabled: cfg.enabled,
            server_max_window_bits: cfg.server_max_window_bits,
            server_no_context_takeover: cfg.server_no_context_takeover,
            client_max_window_bits: cfg.client_max_window_bits,
            client_no_context_takeover: cfg.client_no_context_takeover,
            level: cfg.level,
        }
    }
}

impl UpgraderSection {
    pub fn to_deflate_config(&self) -> wire::DeflateConfig {
        wire::DeflateConfig {
            enabled: self.enabled,
            server_max_window_bits: self.server_max_window_bits,
            server_no_context_takeover: self.server_no_context_takeover,
            client_max_window_bits: self.client_max_window_bits,
            client_no_context_takeover: self.client_no_context_takeover,
            level: self.level,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnSection {
    pub handler: ConnHandlerSection,
    pub manager: ConnManagerSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnHandlerSection {
    pub cache_request_timeout_ms: u64,
    pub cache_expiration_ms: u64,
}

impl Default for ConnHandlerSection {
    fn default() -> Self {
        Self {
            cache_request_timeout_ms: handler::DEFAULT_CACHE_REQUEST_TIMEOUT.as_millis() as u64,
            cache_expiration_ms: handler::DEFAULT_CACHE_EXPIRATION.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnManagerSection {
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub init_retry_interval_ms: u64,
    pub max_retry_interval_ms: u64,
    pub max_retry_count: u32,
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    pub close_timeout_ms: u64,
    pub rate_limit: u32,
    pub idle_timeout_ms: u64,
}

impl Default for ConnManagerSection {
    fn default() -> Self {
        Self {
            read_timeout_ms: conn::DEFAULT_READ_TIMEOUT.as_millis() as u64,
            write_timeout_ms: conn::DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
            init_retry_interval_ms: conn::DEFAULT_INIT_RETRY_INTERVAL.as_millis() as u64,
            max_retry_interval_ms: conn::DEFAULT_MAX_RETRY_INTERVAL.as_millis() as u64,
            max_retry_count: conn::DEFAULT_MAX_RETRY_COUNT,
            send_buffer_size: conn::DEFAULT_SEND_BUFFER_SIZE,
            receive_buffer_size: conn::DEFAULT_RECEIVE_BUFFER_SIZE,
            close_timeout_ms: manager::DEFAULT_CLOSE_TIMEOUT.as_millis() as u64,
            rate_limit: conn::DEFAULT_RATE_LIMIT,
            idle_timeout_ms: manager::DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ConnManagerSection {
    pub fn to_manager_config(&self) -> ConnManagerConfig {
        ConnManagerConfig {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            init_retry_interval: Duration::from_millis(self.init_retry_interval_ms),
            max_retry_interval: Duration::from_millis(self.max_retry_interval_ms),
            max_retry_count: self.max_retry_count,
            send_buffer_size: self.send_buffer_size,
            receive_buffer_size: self.receive_buffer_size,
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            rate_limit: self.rate_limit,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetransmitSection {
    pub interval_ms: u64,
    pub max_retry: u32,
}

impl Default for RetransmitSection {
    fn default() -> Self {
        Self {
            interval_ms: retransmit::DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            max_retry: retransmit::DEFAULT_MAX_RETRY_CNT,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HandlerSection {
    pub frontend: FrontendSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrontendSection {
    pub topic: String,
    pub on_receive_timeout_ms: u64,
}

impl Default for FrontendSection {
    fn default() -> Self {
        Self {
            topic: "synp.frontend.upstream".to_string(),
            on_receive_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsumerSection {
    pub event_message_downstream: ConsumerTopicSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerTopicSection {
    pub topic: String,
    pub group_id: String,
    pub partitions: u32,
}

impl Default for ConsumerTopicSection {
    fn default() -> Self {
        Self {
            topic: "synp.backend.downstream".to_string(),
            group_id: "synp-gateway".to_string(),
            partitions: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimiterSection {
    pub init_capacity: usize,
    pub max_capacity: usize,
    pub increase_step: usize,
    pub increase_interval_ms: u64,
}

impl Default for LimiterSection {
    fn default() -> Self {
        let cfg = TokenBucketConfig::default();
        Self {
            init_capacity: cfg.init_capacity,
            max_capacity: cfg.max_capacity,
            increase_step: cfg.increase_step,
            increase_interval_ms: cfg.increase_interval.as_millis() as u64,
        }
    }
}

impl LimiterSection {
    pub fn to_bucket_config(&self) -> TokenBucketConfig {
        TokenBucketConfig {
            init_capacity: self.init_capacity,
            max_capacity: self.max_capacity,
            increase_step: self.increase_step,
            increase_interval: Duration::from_millis(self.increase_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JwtSection {
    pub issuer: String,
    /// PEM-encoded RSA public key.
    pub public: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub url: String,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsSection {
    pub url: String,
    pub credentials_path: Option<String>,
    pub tls_required: bool,
    pub idempotent_publish: bool,
}

impl Default for NatsSection {
    fn default() -> Self {
        let cfg = mq::JetStreamConfig::default();
        Self {
            url: cfg.url,
            credentials_path: cfg.credentials_path,
            tls_required: cfg.tls_required,
            idempotent_publish: cfg.idempotent_publish,
        }
    }
}

impl NatsSection {
    pub fn to_jetstream_config(&self) -> mq::JetStreamConfig {
        mq::JetStreamConfig {
            url: self.url.clone(),
            credentials_path: self.credentials_path.clone(),
            tls_required: self.tls_required,
            idempotent_publish: self.idempotent_publish,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub port: u16,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { port: 9464 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 17001);
        assert_eq!(cfg.codec.codec_type, "json");
        assert_eq!(cfg.conn.manager.send_buffer_size, 256);
        assert_eq!(cfg.retransmit.interval_ms, 8000);
        assert_eq!(cfg.consumer.event_message_downstream.partitions, 1);
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let raw = r#"
server:
  host: 127.0.0.1
  port: 9000
codec:
  type: proto
upgrader:
  enabled: true
  level: 9
conn:
  manager:
    rate_limit: 50
    read_timeout_ms: 30000
retransmit:
  interval_ms: 2000
  max_retry: 5
consumer:
  event_message_downstream:
    topic: pushes
    group_id: g1
    partitions: 4
"#;
        let cfg: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.codec.codec_type, "proto");
        assert!(cfg.upgrader.enabled);
        assert_eq!(cfg.upgrader.level, 9);
        assert_eq!(cfg.conn.manager.rate_limit, 50);
        assert_eq!(
            cfg.conn.manager.to_manager_config().read_timeout,
            Duration::from_secs(30)
        );
        // Untouched fields keep their defaults.
        assert_eq!(cfg.conn.manager.send_buffer_size, 256);
        assert_eq!(cfg.retransmit.max_retry, 5);
        assert_eq!(cfg.consumer.event_message_downstream.partitions, 4);
    }
}
