//! Message shapes for both directions of the frontend connection and the
//! backend push channel.

use serde::{Deserialize, Serialize};

/// Command carried by a [`Message`].
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    prost::Enumeration,
)]
#[repr(i32)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Unspecified = 0,
    Heartbeat = 1,
    /// Frontend → backend business message.
    Upstream = 2,
    /// Gateway → frontend acknowledgement of an upstream message.
    UpstreamAck = 3,
    /// Backend → frontend push.
    Downstream = 4,
    /// Frontend → gateway acknowledgement of a downstream push.
    DownstreamAck = 5,
}

/// The envelope exchanged with frontends in both directions.
///
/// `message_id` must be non-empty for every command except heartbeat.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(enumeration = "CommandType", tag = "2")]
    pub cmd: i32,
    #[prost(bytes = "vec", tag = "3")]
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(message_id: impl Into<String>, cmd: CommandType, body: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            cmd: cmd as i32,
            body,
        }
    }

    /// The command, tolerating unknown values.
    pub fn command(&self) -> CommandType {
        CommandType::try_from(self.cmd).unwrap_or(CommandType::Unspecified)
    }

    /// Non-heartbeat messages must carry a message id.
    pub fn validate(&self) -> Result<(), String> {
        if self.command() != CommandType::Heartbeat && self.message_id.is_empty() {
            return Err("empty message_id".to_string());
        }
        Ok(())
    }
}

/// Backend → gateway push record, JSON-encoded on the broker.
///
/// All fields must be non-zero / non-empty.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct PushMessage {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(uint64, tag = "2")]
    pub biz_id: u64,
    #[prost(uint64, tag = "3")]
    pub receiver_id: u64,
    #[prost(bytes = "vec", tag = "4")]
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl PushMessage {
    pub fn validate(&self) -> Result<(), String> {
        if self.message_id.is_empty() {
            return Err("empty message_id".to_string());
        }
        if self.biz_id == 0 {
            return Err("empty biz_id".to_string());
        }
        if self.receiver_id == 0 {
            return Err("empty receiver_id".to_string());
        }
        Ok(())
    }
}

/// Body of an `UPSTREAM_ACK` message.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct AckPayload {
    #[prost(bool, tag = "1")]
    pub success: bool,
    /// Unix milliseconds at which the gateway handled the message.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(string, tag = "3")]
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// Byte fields render as base64 strings in the `json` codec.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
