//! Explicit construction of the gateway from configuration.
//!
//! `App::build` wires the production collaborators (Redis, JetStream, JWT
//! validation); `App::assemble` does the pure composition and is what tests
//! call with in-memory substitutes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mq::{ConsumerFactory, JetStreamClient, JetStreamConsumerFactory, Producer};
use protocol::Codec;
use session::{JwtValidator, KvStore, RedisStore, SessionStore, TokenValidator};
use tracing::info;

use crate::config::Config;
use crate::consumer::BrokerConsumer;
use crate::downstream::DownstreamHandler;
use crate::error::Result;
use crate::handler::{ConnEventHandler, EventHandler, EventHandlerChain};
use crate::limiter::TokenBucket;
use crate::manager::ConnManager;
use crate::push::codec_push_fn;
use crate::retransmit::RetransmitManager;
use crate::server::{Server, EVENT_PUSH_MESSAGE};
use crate::upgrader::Upgrader;
use crate::upstream::{DownstreamAckHandler, FrontendMsgHandler, HeartbeatHandler, UpstreamHandler};

/// The assembled gateway and the pieces that need explicit start/stop.
pub struct App {
    pub server: Arc<Server>,
    pub manager: Arc<ConnManager>,
    pub limiter: Arc<TokenBucket>,
    pub retransmit: Arc<RetransmitManager>,
    close_timeout: Duration,
}

impl App {
    /// Connect to the production collaborators and assemble the gateway.
    pub async fn build(config: Config) -> Result<App> {
        let kv: Arc<dyn KvStore> = Arc::new(RedisStore::connect(&config.redis.url).await.map_err(
            session::SessionError::Kv,
        )?);

        let jetstream = JetStreamClient::connect(config.nats.to_jetstream_config()).await?;
        jetstream
            .ensure_stream(&config.handler.frontend.topic)
            .await?;
        jetstream
            .ensure_stream(&config.consumer.event_message_downstream.topic)
            .await?;
        let producer: Arc<dyn Producer> = Arc::new(jetstream.producer());
        let factory: Arc<dyn ConsumerFactory> = Arc::new(JetStreamConsumerFactory::new(jetstream));

        let validator: Arc<dyn TokenValidator> = Arc::new(
            JwtValidator::new(&config.jwt.issuer, &config.jwt.public)
                .map_err(|err| crate::error::GatewayError::Config(err.to_string()))?,
        );

        Self::assemble(config, kv, producer, factory, validator)
    }

    /// Pure composition: no network, no clocks. Collaborators are injected.
    pub fn assemble(
        config: Config,
        kv: Arc<dyn KvStore>,
        producer: Arc<dyn Producer>,
        factory: Arc<dyn ConsumerFactory>,
        validator: Arc<dyn TokenValidator>,
    ) -> Result<App> {
        let codec = Codec::from_name(&config.codec.codec_type)?;
        let push_fn = codec_push_fn(codec);

        let retransmit = RetransmitManager::new(
            Duration::from_millis(config.retransmit.interval_ms),
            config.retransmit.max_retry,
            push_fn.clone(),
        );

        let upstream_handlers: Vec<Arc<dyn UpstreamHandler>> = vec![
            Arc::new(HeartbeatHandler::new(push_fn.clone())),
            Arc::new(FrontendMsgHandler::new(
                config.handler.frontend.topic.clone(),
                Duration::from_millis(config.handler.frontend.on_receive_timeout_ms),
                producer,
                push_fn.clone(),
            )),
            Arc::new(DownstreamAckHandler::new(retransmit.clone())),
        ];
        let downstream = DownstreamHandler::new(push_fn, retransmit.clone());

        let manager_cfg = config.conn.manager.to_manager_config();
        let close_timeout = manager_cfg.close_timeout;
        let manager = Arc::new(ConnManager::new(manager_cfg));

        let event_handler = Arc::new(ConnEventHandler::new(
            kv.clone(),
            Duration::from_millis(config.conn.handler.cache_request_timeout_ms),
            Duration::from_millis(config.conn.handler.cache_expiration_ms),
            codec,
            upstream_handlers,
            downstream,
            retransmit.clone(),
            manager.clone(),
        ));
        let handler: Arc<dyn EventHandler> =
            Arc::new(EventHandlerChain::new(vec![event_handler]));

        let upgrader = Arc::new(Upgrader::new(
            validator,
            SessionStore::new(kv),
            config.upgrader.to_deflate_config(),
        ));

        let limiter = Arc::new(TokenBucket::new(config.limiter.to_bucket_config())?);

        let consumer_cfg = &config.consumer.event_message_downstream;
        let consumers = HashMap::from([(
            EVENT_PUSH_MESSAGE.to_string(),
            BrokerConsumer::new(
                factory,
                consumer_cfg.topic.clone(),
                consumer_cfg.group_id.clone(),
                consumer_cfg.partitions,
            ),
        )]);

        let server = Server::new(
            config.server.to_server_config(),
            upgrader,
            manager.clone(),
            handler,
            consumers,
            limiter.clone(),
        );

        Ok(App {
            server,
            manager,
            limiter,
            retransmit,
            close_timeout,
        })
    }

    /// Start background tasks and the server.
    pub async fn start(&self) -> Result<()> {
        let shutdown = self.server.cancellation_token();

        let limiter = self.limiter.clone();
        let limiter_shutdown = shutdown.clone();
        tokio::spawn(async move { limiter.run(limiter_shutdown).await });

        self.manager.clone().start_idle_reaper(shutdown);

        self.server.clone().start().await?;
        info!("gateway started");
        Ok(())
    }

    pub async fn graceful_shutdown(&self) {
        self.server.graceful_shutdown(self.close_timeout).await;
        self.retransmit.close();
        info!("gateway stopped");
    }
}
