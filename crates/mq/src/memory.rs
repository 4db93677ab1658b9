//! In-process broker with queue semantics, for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{MqError, Result};
use crate::record::{Consumer, ConsumerFactory, Producer, Record};

struct TopicQueue {
    tx: mpsc::UnboundedSender<Record>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Record>>>,
    published: Arc<AtomicUsize>,
}

impl TopicQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            published: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// One queue per topic; consumers share the queue, so each record is
/// delivered to exactly one of them, like a single consumer group.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    topics: Arc<Mutex<HashMap<String, TopicQueue>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_topic<T>(&self, topic: &str, f: impl FnOnce(&TopicQueue) -> T) -> T {
        let mut topics = self.topics.lock().unwrap();
        let queue = topics
            .entry(topic.to_string())
            .or_insert_with(TopicQueue::new);
        f(queue)
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
        }
    }

    /// How many records have been produced to a topic. Test observability.
    pub fn published_count(&self, topic: &str) -> usize {
        self.with_topic(topic, |queue| queue.published.load(Ordering::SeqCst))
    }
}

#[derive(Clone)]
pub struct MemoryProducer {
    broker: MemoryBroker,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn produce(&self, record: Record) -> Result<()> {
        let topic = record.topic.clone();
        self.broker.with_topic(&topic, |queue| {
            queue.published.fetch_add(1, Ordering::SeqCst);
            queue
                .tx
                .send(record)
                .map_err(|_| MqError::Publish("topic queue closed".to_string()))
        })
    }
}

#[async_trait]
impl ConsumerFactory for MemoryBroker {
    async fn consumer(&self, topic: &str, _group_id: &str) -> Result<Box<dyn Consumer>> {
        let rx = self.with_topic(topic, |queue| queue.rx.clone());
        Ok(Box::new(MemoryConsumer { rx }))
    }
}

pub struct MemoryConsumer {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Record>>>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Record> {
        self.rx.lock().await.recv().await.ok_or(MqError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produce_then_consume() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();

        producer
            .produce(Record::new("t", b"k".to_vec(), b"v1".to_vec()))
            .await
            .unwrap();
        producer
            .produce(Record::new("t", b"k".to_vec(), b"v2".to_vec()))
            .await
            .unwrap();

        let mut consumer = broker.consumer("t", "g").await.unwrap();
        assert_eq!(consumer.next().await.unwrap().value, b"v1");
        assert_eq!(consumer.next().await.unwrap().value, b"v2");
        assert_eq!(broker.published_count("t"), 2);
    }

    #[tokio::test]
    async fn queue_shared_across_group_members() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        producer
            .produce(Record::new("t", Vec::new(), b"only".to_vec()))
            .await
            .unwrap();

        let mut first = broker.consumer("t", "g").await.unwrap();
        let mut second = broker.consumer("t", "g").await.unwrap();

        // Exactly one of the two consumers sees the record.
        let got = first.next().await.unwrap();
        assert_eq!(got.value, b"only");

        producer
            .produce(Record::new("t", Vec::new(), b"next".to_vec()))
            .await
            .unwrap();
        assert_eq!(second.next().await.unwrap().value, b"next");
    }
}
