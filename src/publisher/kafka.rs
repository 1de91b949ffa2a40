use super::{Message, Transport};
use crate::config::KafkaConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Base librdkafka settings shared by producers, consumers and admin clients.
pub fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", config.brokers.join(","));
    for (key, value) in &config.properties {
        client.set(key, value);
    }
    client
}

/// Creates topics on first use and remembers which ones exist.
pub struct TopicAdmin {
    admin_client: AdminClient<DefaultClientContext>,
    partitions: i32,
    replication_factor: i32,
    known_topics: parking_lot::Mutex<HashSet<String>>,
}

impl TopicAdmin {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let admin_client: AdminClient<_> = client_config(config).create()?;

        Ok(Self {
            admin_client,
            partitions: config.partitions,
            replication_factor: config.replication_factor,
            known_topics: parking_lot::Mutex::new(HashSet::new()),
        })
    }

    #[instrument(skip(self), fields(topic = %topic_name))]
    pub async fn ensure_topic_exists(&self, topic_name: &str) -> Result<()> {
        if self.known_topics.lock().contains(topic_name) {
            debug!("Topic '{}' already verified to exist", topic_name);
            return Ok(());
        }

        let new_topic = NewTopic::new(
            topic_name,
            self.partitions,
            TopicReplication::Fixed(self.replication_factor),
        )
        .set("cleanup.policy", "delete")
        .set("retention.ms", "604800000"); // 7 days

        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));

        let results = self.admin_client.create_topics(&[new_topic], &opts).await?;

        for result in results {
            match result {
                Ok(topic) => info!("Created topic: {}", topic),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("Topic '{}' already exists", topic)
                }
                Err((_topic, error)) => return Err(Error::Kafka(KafkaError::AdminOp(error))),
            }
        }

        self.known_topics.lock().insert(topic_name.to_string());
        Ok(())
    }
}

/// Kafka-protocol transport. Siblings created with [`Transport::create`]
/// share one producer and one admin client.
pub struct KafkaTransport {
    producer: FutureProducer,
    admin: Arc<TopicAdmin>,
    topic: String,
    send_timeout: Duration,
}

impl KafkaTransport {
    pub fn new(config: &KafkaConfig, topic: &str, send_timeout: Duration) -> Result<Self> {
        let producer: FutureProducer = client_config(config)
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("linger.ms", config.linger_ms.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()?;

        Ok(Self {
            producer,
            admin: Arc::new(TopicAdmin::new(config)?),
            topic: topic.to_string(),
            send_timeout,
        })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    fn destination(&self) -> &str {
        &self.topic
    }

    async fn create(&self, destination: &str) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(KafkaTransport {
            producer: self.producer.clone(),
            admin: Arc::clone(&self.admin),
            topic: destination.to_string(),
            send_timeout: self.send_timeout,
        }))
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> Result<()> {
        // Enqueue everything first so librdkafka can batch, then await
        // deliveries in order.
        let mut deliveries = Vec::with_capacity(messages.len());
        for message in &messages {
            let mut record = FutureRecord::to(&self.topic).payload(message.payload.as_ref());
            if let Some(key) = &message.key {
                record = record.key(key.as_str());
            }
            let delivery = self
                .producer
                .send_result(record)
                .map_err(|(e, _)| Error::Kafka(e))?;
            deliveries.push(delivery);
        }

        let wait_all = async {
            for delivery in deliveries {
                match delivery.await {
                    Ok(Ok(_)) => {}
                    Ok(Err((e, _))) => return Err(Error::Kafka(e)),
                    Err(_) => {
                        return Err(Error::Publish(format!(
                            "delivery to '{}' was cancelled",
                            self.topic
                        )))
                    }
                }
            }
            Ok(())
        };

        tokio::time::timeout(self.send_timeout, wait_all)
            .await
            .map_err(|_| Error::timeout(format!("publish to '{}'", self.topic)))?
    }

    async fn ensure_destination_exists(&self, destination: &str) -> Result<()> {
        self.admin.ensure_topic_exists(destination).await
    }

    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.send_timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| Error::Publish(format!("flush task failed: {}", e)))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn kafka_config() -> KafkaConfig {
        KafkaConfig {
            brokers: std::env::var("TEST_KAFKA_BROKERS")
                .unwrap_or_else(|_| "localhost:9092".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            compression: "none".to_string(),
            acks: "all".to_string(),
            linger_ms: 0,
            message_timeout_ms: 5000,
            partitions: 1,
            replication_factor: 1,
            properties: HashMap::new(),
        }
    }

    #[test]
    fn test_client_config_passes_properties() {
        let mut config = kafka_config();
        config
            .properties
            .insert("security.protocol".into(), "SASL_SSL".into());
        let client = client_config(&config);
        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert!(client.get("bootstrap.servers").is_some());
    }

    #[tokio::test]
    #[ignore] // Requires running Kafka
    async fn test_publish_to_created_topic() {
        let transport = KafkaTransport::new(&kafka_config(), "dstream-test-ingest", Duration::from_secs(10)).unwrap();
        let topic = format!("dstream-test-{}", std::process::id());
        transport.ensure_destination_exists(&topic).await.unwrap();
        transport.ensure_destination_exists(&topic).await.unwrap();

        let sibling = transport.create(&topic).await.unwrap();
        sibling
            .publish_batch(vec![
                Message::new(Some("k".into()), b"one".to_vec()),
                Message::new(Some("k".into()), b"two".to_vec()),
            ])
            .await
            .unwrap();
        transport.close().await.unwrap();
    }
}
