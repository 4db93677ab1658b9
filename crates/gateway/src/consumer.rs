//! Partitioned broker consume loop.

use std::sync::Arc;

use futures::future::BoxFuture;
use mq::{ConsumerFactory, MqError, Record};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;

/// Handler invoked once per consumed record.
pub type ConsumeFn = Arc<dyn Fn(Record) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Consumes one `(topic, group)` pair with a configurable number of worker
/// tasks, each owning its own broker consumer handle.
pub struct BrokerConsumer {
    factory: Arc<dyn ConsumerFactory>,
    topic: String,
    group_id: String,
    partitions: u32,
    token: CancellationToken,
}

impl BrokerConsumer {
    pub fn new(
        factory: Arc<dyn ConsumerFactory>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        partitions: u32,
    ) -> Self {
        Self {
            factory,
            topic: topic.into(),
            group_id: group_id.into(),
            partitions: partitions.max(1),
            token: CancellationToken::new(),
        }
    }

    /// Spawn the worker loops. Each loop reads one record and invokes
    /// `consume`; handler errors are logged and consumption continues.
    pub async fn start(&self, shutdown: CancellationToken, consume: ConsumeFn) -> Result<()> {
        for partition in 0..self.partitions {
            let mut consumer = self
                .factory
                .consumer(&self.topic, &self.group_id)
                .await
                .map_err(|err| {
                    error!(
                        topic = %self.topic,
                        group_id = %self.group_id,
                        partition,
                        error = %err,
                        "failed to create consumer"
                    );
                    err
                })?;

            let consume = consume.clone();
            let inner = self.token.clone();
            let shutdown = shutdown.clone();
            let topic = self.topic.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.cancelled() => {
                            info!(%topic, partition, "consumer stopped");
                            return;
                        }
                        _ = shutdown.cancelled() => {
                            info!(%topic, partition, "consumer shut down");
                            return;
                        }
                        next = consumer.next() => match next {
                            Err(MqError::Closed) => {
                                warn!(%topic, partition, "consumer stream ended");
                                return;
                            }
                            Err(err) => {
                                warn!(%topic, partition, error = %err, "failed to read record");
                            }
                            Ok(record) => {
                                if let Err(err) = consume(record).await {
                                    error!(%topic, partition, error = %err, "failed to consume record");
                                }
                            }
                        }
                    }
                }
            });
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq::{MemoryBroker, Producer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn records_reach_the_consume_fn() {
        let broker = MemoryBroker::new();
        let consumer = BrokerConsumer::new(Arc::new(broker.clone()), "t", "g", 2);

        let seen = Arc::new(AtomicUsize::new(0));
        let consume: ConsumeFn = {
            let seen = seen.clone();
            Arc::new(move |_record| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        };

        consumer
            .start(CancellationToken::new(), consume)
            .await
            .unwrap();

        let producer = broker.producer();
        for i in 0..5u8 {
            producer
                .produce(Record::new("t", Vec::new(), vec![i]))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all records consumed");

        consumer.stop();
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_the_loop() {
        let broker = MemoryBroker::new();
        let consumer = BrokerConsumer::new(Arc::new(broker.clone()), "t", "g", 1);

        let seen = Arc::new(AtomicUsize::new(0));
        let consume: ConsumeFn = {
            let seen = seen.clone();
            Arc::new(move |record| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if record.value == b"bad" {
                        Err(crate::error::GatewayError::InvalidMessage("bad".into()))
                    } else {
                        Ok(())
                    }
                })
            })
        };

        consumer
            .start(CancellationToken::new(), consume)
            .await
            .unwrap();

        let producer = broker.producer();
        producer
            .produce(Record::new("t", Vec::new(), b"bad".to_vec()))
            .await
            .unwrap();
        producer
            .produce(Record::new("t", Vec::new(), b"good".to_vec()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loop survived the handler error");

        consumer.stop();
    }
}
