//! Message-broker client: produce one record, read one record and commit.
//!
//! The gateway only ever needs those two verbs, so they are the whole
//! interface. [`jetstream`] is the production implementation (NATS JetStream,
//! durable pull consumers as consumer groups); [`memory`] is an in-process
//! broker for tests and local development.

pub mod error;
pub mod jetstream;
pub mod memory;
pub mod record;

pub use error::{MqError, Result};
pub use jetstream::{JetStreamClient, JetStreamConfig, JetStreamConsumerFactory, JetStreamProducer};
pub use memory::{MemoryBroker, MemoryProducer};
pub use record::{Consumer, ConsumerFactory, Producer, Record};
