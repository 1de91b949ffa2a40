pub mod console;
pub mod ingest;
pub mod kafka;
pub mod memory;
pub mod topic;

use crate::config::PublisherConfig;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

pub use console::ConsoleTransport;
pub use ingest::{ChangePublisher, IngestPublisher, IngestSettings, PublishAck};
pub use kafka::KafkaTransport;
pub use memory::{MemoryBus, MemoryIngestReceiver, MemoryTransport};
pub use topic::TopicNamer;

/// One keyed record on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: Option<String>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(key: Option<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }
}

/// A connection to the bus bound to one destination.
///
/// Transports created from another share its underlying connection.
#[async_trait]
pub trait Transport: Send + Sync {
    fn destination(&self) -> &str;

    /// A transport bound to `destination` on the same connection.
    async fn create(&self, destination: &str) -> Result<Arc<dyn Transport>>;

    /// Sends all messages in order; returns only once every message is
    /// accepted, or the first failure.
    async fn publish_batch(&self, messages: Vec<Message>) -> Result<()>;

    /// Creates `destination` if it does not exist. Idempotent.
    async fn ensure_destination_exists(&self, destination: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds the base transport for the configured bus, bound to `destination`.
pub fn build_transport(
    config: &PublisherConfig,
    destination: &str,
    send_timeout: Duration,
) -> Result<Arc<dyn Transport>> {
    match config {
        PublisherConfig::Kafka(kafka) => Ok(Arc::new(KafkaTransport::new(
            kafka,
            destination,
            send_timeout,
        )?)),
        PublisherConfig::Console => Ok(Arc::new(ConsoleTransport::new(destination))),
    }
}
