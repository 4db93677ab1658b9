//! HTTP → WebSocket upgrade: token validation, device/auto-close extraction,
//! compression negotiation, session creation.

use session::{Device, Session, SessionStore, TokenValidator};
use std::sync::Arc;
use tracing::{info, warn};
use wire::handshake;
use wire::{BoxedIo, DeflateConfig, DeflateState};

use crate::error::{GatewayError, Result};

/// Upgrades raw accepted streams into authenticated WebSocket sessions.
pub struct Upgrader {
    validator: Arc<dyn TokenValidator>,
    sessions: SessionStore,
    deflate: DeflateConfig,
}

impl Upgrader {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        sessions: SessionStore,
        deflate: DeflateConfig,
    ) -> Self {
        Self {
            validator,
            sessions,
            deflate,
        }
    }

    /// Run the handshake. On failure the socket gets an HTTP error response
    /// and the error is returned; on success the 101 response has been
    /// written and the stream speaks WebSocket from here on.
    pub async fn upgrade(&self, io: &mut BoxedIo) -> Result<(Session, Option<DeflateState>)> {
        let request = match handshake::read_request(io).await {
            Ok(request) => request,
            Err(err) => {
                let _ = handshake::write_reject(io, 400, "bad handshake").await;
                return Err(GatewayError::Wire(err));
            }
        };

        let token = match request.query_param("token") {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => {
                let _ = handshake::write_reject(io, 401, "token is required").await;
                return Err(GatewayError::TokenRequired);
            }
        };

        let mut user = match self.validator.validate(&token).await {
            Ok(user) => user,
            Err(err) => {
                let _ = handshake::write_reject(io, 401, "invalid token").await;
                return Err(GatewayError::InvalidToken(err.to_string()));
            }
        };

        user.device = request
            .query_param("device")
            .map(Device::parse)
            .unwrap_or(Device::Unknown);
        user.auto_close = request
            .header("x-auto-close")
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let offers = request.extension_offers();
        let negotiated = self.deflate.negotiate(&offers);
        if self.deflate.enabled && !offers.is_empty() && negotiated.is_none() {
            warn!("failed to negotiate compression, downgrade to no compression");
        }

        let (session, is_new) = match self.sessions.build(&user).await {
            Ok(built) => built,
            Err(err) => {
                let _ = handshake::write_reject(io, 500, "session unavailable").await;
                return Err(GatewayError::Session(err));
            }
        };
        if !is_new {
            warn!(conn_key = %user.conn_key(), "session already exists");
        }

        handshake::write_accept(io, &request, negotiated.as_ref()).await?;

        if let Some(params) = negotiated {
            info!(conn_key = %user.conn_key(), ?params, "compression negotiated");
        }
        let state = negotiated.map(|params| DeflateState {
            params,
            level: self.deflate.level,
        });
        Ok((session, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session::{KvStore, MemoryStore, StaticValidator, User};
    use std::sync::Arc;

    fn upgrader(deflate_enabled: bool) -> Upgrader {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let user = User {
            biz_id: 1,
            user_id: 42,
            device: Device::Unknown,
            auto_close: false,
        };
        let validator = StaticValidator::new().with_token("good-token", user);
        Upgrader::new(
            Arc::new(validator),
            SessionStore::new(kv),
            DeflateConfig {
                enabled: deflate_enabled,
                ..Default::default()
            },
        )
    }

    async fn run_upgrade(
        upgrader: Upgrader,
        path: &str,
        headers: &'static [(&'static str, &'static str)],
        client_deflate: bool,
    ) -> (
        Result<(Session, Option<DeflateState>)>,
        wire::Result<Option<wire::DeflateParams>>,
    ) {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let mut server: BoxedIo = Box::new(server);
        let path = path.to_string();

        let client_task = tokio::spawn(async move {
            let mut client = client;
            let offer = DeflateConfig {
                enabled: client_deflate,
                ..Default::default()
            };
            handshake::connect(&mut client, "gateway", &path, headers, Some(&offer)).await
        });

        let server_result = upgrader.upgrade(&mut server).await;
        let client_result = client_task.await.unwrap();
        (server_result, client_result)
    }

    #[tokio::test]
    async fn successful_upgrade_builds_session() {
        let (server, client) = run_upgrade(
            upgrader(false),
            "/ws?token=good-token&device=mobile",
            &[("x-auto-close", "true")],
            false,
        )
        .await;

        let (session, state) = server.unwrap();
        assert!(client.is_ok());
        assert!(state.is_none());

        let user = session.user();
        assert_eq!(user.device, Device::Mobile);
        assert!(user.auto_close);
        assert_eq!(user.conn_id(), "1:42:mobile");
    }

    #[tokio::test]
    async fn missing_token_rejected() {
        let (server, client) = run_upgrade(upgrader(false), "/ws?device=pc", &[], false).await;
        assert!(matches!(server, Err(GatewayError::TokenRequired)));
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn bad_token_rejected() {
        let (server, client) =
            run_upgrade(upgrader(false), "/ws?token=wrong", &[], false).await;
        assert!(matches!(server, Err(GatewayError::InvalidToken(_))));
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn unknown_device_falls_back() {
        let (server, _client) = run_upgrade(
            upgrader(false),
            "/ws?token=good-token&device=toaster",
            &[],
            false,
        )
        .await;
        let (session, _) = server.unwrap();
        assert_eq!(session.user().device, Device::Unknown);
    }

    #[tokio::test]
    async fn compression_negotiated_when_both_sides_enable() {
        let (server, client) =
            run_upgrade(upgrader(true), "/ws?token=good-token", &[], true).await;
        let (_, state) = server.unwrap();
        assert!(state.is_some());
        assert!(client.unwrap().is_some());
    }

    #[tokio::test]
    async fn compression_skipped_when_client_does_not_offer() {
        let (server, client) =
            run_upgrade(upgrader(true), "/ws?token=good-token", &[], false).await;
        let (_, state) = server.unwrap();
        assert!(state.is_none());
        assert!(client.unwrap().is_none());
    }
}
