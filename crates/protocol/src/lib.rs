//! Wire message shapes shared by the gateway and its clients, plus the
//! selectable codec used on the frontend connection.
//!
//! The same structs carry both encodings: `serde` derives for the `json`
//! codec and hand-written `prost` field tags for the `proto` codec, so the
//! two stay structurally identical by construction.

pub mod codec;
pub mod message;

pub use codec::{Codec, CodecError};
pub use message::{AckPayload, CommandType, Message, PushMessage};
