use super::{IngestDelivery, IngestReceiver};
use crate::config::KafkaConfig;
use crate::publisher::kafka::client_config;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

/// Consumes the ingest queue as part of a consumer group. Offsets are only
/// committed explicitly, after forwarding.
pub struct KafkaIngestReceiver {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaIngestReceiver {
    pub fn new(config: &KafkaConfig, group_id: &str, topic: &str) -> Result<Self> {
        let consumer: StreamConsumer = client_config(config)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[topic])?;
        info!(topic = %topic, group_id = %group_id, "Subscribed to ingest queue");

        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl IngestReceiver for KafkaIngestReceiver {
    async fn receive(&mut self) -> Result<Option<IngestDelivery>> {
        let message = self.consumer.recv().await?;
        Ok(Some(IngestDelivery {
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
        }))
    }

    async fn commit(&mut self, partition: i32, next_offset: i64) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(&self.topic, partition, Offset::Offset(next_offset))?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        debug!(partition, offset = next_offset, "Committed ingest offset");
        Ok(())
    }
}
