//! User identity and the keys derived from it.

use serde::{Deserialize, Serialize};

/// Device class a frontend connects from. One user may hold one live
/// connection per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Mobile,
    Tablet,
    Pc,
    #[default]
    Unknown,
}

impl Device {
    /// Parse a device query parameter; anything unrecognized is `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value {
            "mobile" => Device::Mobile,
            "tablet" => Device::Tablet,
            "pc" => Device::Pc,
            _ => Device::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Mobile => "mobile",
            Device::Tablet => "tablet",
            Device::Pc => "pc",
            Device::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated user on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub biz_id: u64,
    pub user_id: u64,
    #[serde(default)]
    pub device: Device,
    /// Whether the gateway may close this connection when idle.
    #[serde(default)]
    pub auto_close: bool,
}

impl User {
    /// Identifier of one live connection: `{biz}:{user}:{device}`.
    pub fn conn_id(&self) -> String {
        format!("{}:{}:{}", self.biz_id, self.user_id, self.device)
    }

    /// Groups every device of one user: `{biz}:{user}`.
    pub fn conn_key(&self) -> String {
        format!("{}:{}", self.biz_id, self.user_id)
    }

    /// KV key of this user's session.
    pub fn session_key(&self) -> String {
        format!("synp:session:{}:{}", self.biz_id, self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_keys() {
        let user = User {
            biz_id: 1,
            user_id: 42,
            device: Device::Mobile,
            auto_close: false,
        };
        assert_eq!(user.conn_id(), "1:42:mobile");
        assert_eq!(user.conn_key(), "1:42");
        assert_eq!(user.session_key(), "synp:session:1:42");
    }

    #[test]
    fn device_parsing() {
        assert_eq!(Device::parse("mobile"), Device::Mobile);
        assert_eq!(Device::parse("tablet"), Device::Tablet);
        assert_eq!(Device::parse("pc"), Device::Pc);
        assert_eq!(Device::parse("fridge"), Device::Unknown);
        assert_eq!(Device::parse(""), Device::Unknown);
    }
}
