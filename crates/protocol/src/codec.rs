//! Selectable frontend codec: `json` or `proto` over the same shapes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Codec error type.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("proto codec error: {0}")]
    Proto(#[from] prost::DecodeError),

    #[error("unknown codec {0:?}")]
    UnknownCodec(String),
}

/// The message codec used on frontend connections, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    Proto,
}

impl Codec {
    pub fn from_name(name: &str) -> Result<Self, CodecError> {
        match name {
            "json" => Ok(Codec::Json),
            "proto" => Ok(Codec::Proto),
            other => Err(CodecError::UnknownCodec(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Json => "json",
            Codec::Proto => "proto",
        }
    }

    pub fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: prost::Message + Serialize,
    {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
            Codec::Proto => Ok(value.encode_to_vec()),
        }
    }

    pub fn decode<T>(&self, data: &[u8]) -> Result<T, CodecError>
    where
        T: prost::Message + DeserializeOwned + Default,
    {
        match self {
            Codec::Json => Ok(serde_json::from_slice(data)?),
            Codec::Proto => Ok(T::decode(data)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckPayload, CommandType, Message};

    fn sample_message() -> Message {
        Message::new("m-123", CommandType::Upstream, b"body bytes".to_vec())
    }

    #[test]
    fn json_roundtrip() {
        let codec = Codec::Json;
        let msg = sample_message();
        let bytes = codec.encode(&msg).unwrap();
        let back: Message = codec.decode(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn proto_roundtrip() {
        let codec = Codec::Proto;
        let msg = sample_message();
        let bytes = codec.encode(&msg).unwrap();
        let back: Message = codec.decode(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn ack_payload_roundtrip_both_codecs() {
        let ack = AckPayload {
            success: false,
            timestamp: 1_700_000_000_000,
            error_message: "forward failed".to_string(),
        };
        for codec in [Codec::Json, Codec::Proto] {
            let bytes = codec.encode(&ack).unwrap();
            let back: AckPayload = codec.decode(&bytes).unwrap();
            assert_eq!(back, ack, "codec {}", codec.name());
        }
    }

    #[test]
    fn codec_lookup_by_name() {
        assert_eq!(Codec::from_name("json").unwrap(), Codec::Json);
        assert_eq!(Codec::from_name("proto").unwrap(), Codec::Proto);
        assert!(Codec::from_name("msgpack").is_err());
    }

    #[test]
    fn proto_rejects_garbage() {
        let result: Result<Message, _> = Codec::Proto.decode(&[0xff, 0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }
}
