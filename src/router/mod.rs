//! Drains the ingest queue and forwards each message to the topic named in
//! its `metadata.Destination`.
//!
//! One receive loop hands deliveries to a small pool of forwarders. A
//! destination always maps to the same forwarder, so messages for one topic
//! keep their ingest order. Offsets are committed only once every earlier
//! delivery on the partition has been forwarded (see [`AckTracker`]), which
//! makes the router at-least-once: a crash replays uncommitted messages.

pub mod kafka;
pub mod tracker;

use crate::cdc::backoff::Backoff;
use crate::config::{Config, PublisherConfig, RouterConfig};
use crate::publisher::{self, Message, TopicNamer, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use kafka::KafkaIngestReceiver;
pub use tracker::AckTracker;

/// One message read from the ingest queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestDelivery {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Bytes,
}

/// Consumer side of the ingest queue.
#[async_trait]
pub trait IngestReceiver: Send {
    /// Next delivery, or `None` once the queue is closed. Must be safe to
    /// drop mid-wait without losing a message.
    async fn receive(&mut self) -> Result<Option<IngestDelivery>>;

    /// Records that everything before `next_offset` on `partition` is done.
    async fn commit(&mut self, partition: i32, next_offset: i64) -> Result<()>;
}

#[derive(Deserialize)]
struct Envelope {
    metadata: EnvelopeMetadata,
}

#[derive(Deserialize)]
struct EnvelopeMetadata {
    #[serde(rename = "Destination")]
    destination: Option<String>,
}

/// Reads `metadata.Destination` without decoding the rest of the event.
pub fn destination_of(payload: &[u8]) -> Option<String> {
    serde_json::from_slice::<Envelope>(payload)
        .ok()
        .and_then(|e| e.metadata.destination)
        .filter(|d| !d.is_empty())
}

/// Destination transports keyed by topic name, created on first use.
pub struct TopicCache {
    base: Arc<dyn Transport>,
    topics: RwLock<HashMap<String, Arc<dyn Transport>>>,
}

impl TopicCache {
    pub fn new(base: Arc<dyn Transport>) -> Self {
        Self {
            base,
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub async fn prewarm<I>(&self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        for topic in topics {
            self.get(&topic).await?;
            debug!(topic = %topic, "Destination transport ready");
        }
        Ok(())
    }

    pub async fn get(&self, topic: &str) -> Result<Arc<dyn Transport>> {
        if let Some(transport) = self.topics.read().get(topic) {
            return Ok(Arc::clone(transport));
        }

        self.base.ensure_destination_exists(topic).await?;
        let created = self.base.create(topic).await?;
        let mut topics = self.topics.write();
        Ok(Arc::clone(
            topics.entry(topic.to_string()).or_insert(created),
        ))
    }

    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every destination transport, then the base one.
    pub async fn close_all(&self) -> Result<()> {
        let topics: Vec<_> = self.topics.write().drain().collect();
        for (topic, transport) in topics {
            if let Err(e) = transport.close().await {
                warn!(topic = %topic, error = %e, "Failed to close destination transport");
            }
        }
        self.base.close().await
    }
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub forwarders: usize,
    pub max_in_flight: usize,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            forwarders: 4,
            max_in_flight: 1000,
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
        }
    }
}

impl From<&RouterConfig> for RouterSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            forwarders: config.forwarders.max(1),
            max_in_flight: config.max_in_flight.max(1),
            retry_initial: Duration::from_millis(config.retry_initial_ms),
            retry_max: Duration::from_millis(config.retry_max_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub forwarded: u64,
    /// Messages without a usable destination; committed without forwarding.
    pub dropped: u64,
}

struct Job {
    partition: i32,
    offset: i64,
    destination: String,
    message: Message,
}

struct Done {
    partition: i32,
    offset: i64,
    forwarded: bool,
}

pub struct Router {
    topics: Arc<TopicCache>,
    settings: RouterSettings,
}

impl Router {
    pub fn new(base: Arc<dyn Transport>, settings: RouterSettings) -> Self {
        Self {
            topics: Arc::new(TopicCache::new(base)),
            settings,
        }
    }

    pub fn topics(&self) -> &TopicCache {
        &self.topics
    }

    /// Routes until `cancel` fires or the queue closes, then drains in-flight
    /// forwards, commits what completed and closes every transport.
    pub async fn run<R: IngestReceiver>(
        &self,
        mut receiver: R,
        cancel: CancellationToken,
    ) -> Result<RouterStats> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Done>();
        let stop_forwarding = cancel.child_token();
        let mut lanes = Vec::with_capacity(self.settings.forwarders);
        let mut forwarders = JoinSet::new();
        for _ in 0..self.settings.forwarders.max(1) {
            let (tx, rx) = mpsc::unbounded_channel::<Job>();
            lanes.push(tx);
            forwarders.spawn(forward_loop(
                Arc::clone(&self.topics),
                rx,
                done_tx.clone(),
                self.settings.clone(),
                stop_forwarding.clone(),
            ));
        }
        drop(done_tx);

        let mut tracker = AckTracker::new();
        let mut stats = RouterStats::default();
        let mut receive_failures = 0u32;
        info!(forwarders = lanes.len(), "Router started");

        let result = loop {
            let can_receive = tracker.in_flight() < self.settings.max_in_flight;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(done) = done_rx.recv() => {
                    if done.forwarded {
                        stats.forwarded += 1;
                    }
                    if let Err(e) = settle(&mut tracker, &mut receiver, done).await {
                        warn!(error = %e, "Failed to commit ingest offset");
                    }
                }
                delivery = receiver.receive(), if can_receive => match delivery {
                    Ok(Some(delivery)) => {
                        receive_failures = 0;
                        tracker.track(delivery.partition, delivery.offset);
                        let Some(destination) = destination_of(&delivery.payload) else {
                            warn!(
                                partition = delivery.partition,
                                offset = delivery.offset,
                                "Ingest message has no destination, dropping"
                            );
                            stats.dropped += 1;
                            let done = Done {
                                partition: delivery.partition,
                                offset: delivery.offset,
                                forwarded: true,
                            };
                            if let Err(e) = settle(&mut tracker, &mut receiver, done).await {
                                warn!(error = %e, "Failed to commit ingest offset");
                            }
                            continue;
                        };
                        let lane = lane_for(&destination, lanes.len());
                        let job = Job {
                            partition: delivery.partition,
                            offset: delivery.offset,
                            destination,
                            message: Message::new(delivery.key, delivery.payload),
                        };
                        if lanes[lane].send(job).is_err() {
                            break Err(Error::Shutdown);
                        }
                    }
                    Ok(None) => {
                        info!("Ingest queue closed");
                        break Ok(());
                    }
                    Err(e) if e.is_transient() => {
                        receive_failures += 1;
                        warn!(error = %e, failures = receive_failures, "Failed to receive from ingest queue");
                        tokio::select! {
                            _ = cancel.cancelled() => break Ok(()),
                            _ = tokio::time::sleep(self.settings.retry_initial) => {}
                        }
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        // Forwarders finish their current job; pending retries stop on cancel.
        drop(lanes);
        if result.is_err() {
            stop_forwarding.cancel();
        }
        while let Some(done) = done_rx.recv().await {
            if done.forwarded {
                stats.forwarded += 1;
            }
            if let Err(e) = settle(&mut tracker, &mut receiver, done).await {
                warn!(error = %e, "Failed to commit ingest offset");
            }
        }
        while forwarders.join_next().await.is_some() {}

        if let Err(e) = self.topics.close_all().await {
            warn!(error = %e, "Failed to close transports");
        }
        info!(
            forwarded = stats.forwarded,
            dropped = stats.dropped,
            "Router stopped"
        );
        result.map(|()| stats)
    }
}

fn lane_for(destination: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    destination.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

async fn settle<R: IngestReceiver>(
    tracker: &mut AckTracker,
    receiver: &mut R,
    done: Done,
) -> Result<()> {
    if !done.forwarded {
        return Ok(());
    }
    if let Some(next) = tracker.complete(done.partition, done.offset) {
        receiver.commit(done.partition, next).await?;
    }
    Ok(())
}

async fn forward_loop(
    topics: Arc<TopicCache>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    done: mpsc::UnboundedSender<Done>,
    settings: RouterSettings,
    cancel: CancellationToken,
) {
    while let Some(job) = jobs.recv().await {
        let forwarded = forward(&topics, &job, &settings, &cancel).await;
        let _ = done.send(Done {
            partition: job.partition,
            offset: job.offset,
            forwarded,
        });
    }
}

/// Publishes one message, retrying until it is accepted or `cancel` fires.
async fn forward(
    topics: &TopicCache,
    job: &Job,
    settings: &RouterSettings,
    cancel: &CancellationToken,
) -> bool {
    let mut backoff = Backoff::new(settings.retry_initial, settings.retry_max);
    loop {
        let attempt = async {
            let transport = topics.get(&job.destination).await?;
            transport.publish_batch(vec![job.message.clone()]).await
        };
        match attempt.await {
            Ok(()) => {
                debug!(topic = %job.destination, offset = job.offset, "Forwarded message");
                return true;
            }
            Err(e) => {
                error!(
                    topic = %job.destination,
                    offset = job.offset,
                    error = %e,
                    retry_in = ?backoff.current(),
                    "Failed to forward message"
                );
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(backoff.delay()) => {}
        }
        backoff.grow();
    }
}

/// Builds the router from configuration and runs it against the Kafka
/// ingest queue.
pub async fn serve(config: &Config, cancel: CancellationToken) -> Result<RouterStats> {
    let PublisherConfig::Kafka(kafka) = &config.publisher else {
        return Err(Error::Config(
            "router requires a kafka publisher to read the ingest queue".into(),
        ));
    };
    let ingester = config.ingester()?;

    let base = publisher::build_transport(
        &config.publisher,
        &ingester.ingest_queue,
        ingester.publish_timeout(),
    )?;
    let router = Router::new(base, RouterSettings::from(&config.router));

    let namer = TopicNamer::from_connection_string(&ingester.db_connection_string)?;
    router
        .topics()
        .prewarm(ingester.tables.iter().map(|t| namer.topic(&t.name)).collect::<Vec<_>>())
        .await?;
    info!(topics = router.topics().len(), "Destination topics ready");

    let receiver = KafkaIngestReceiver::new(kafka, &config.router.group_id, &ingester.ingest_queue)?;
    router.run(receiver, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::MemoryBus;

    fn event(destination: &str, id: u32) -> Message {
        Message::new(
            Some("Persons".into()),
            format!(
                r#"{{"data":{{"ID":"{}"}},"metadata":{{"TableName":"Persons","Destination":"{}"}}}}"#,
                id, destination
            )
            .into_bytes(),
        )
    }

    fn router(bus: &MemoryBus) -> Router {
        Router::new(
            Arc::new(bus.transport("ingest-queue")),
            RouterSettings {
                retry_initial: Duration::from_millis(10),
                retry_max: Duration::from_millis(40),
                ..Default::default()
            },
        )
    }

    async fn wait_for(bus: &MemoryBus, topic: &str, committed: i64) {
        while bus.committed(topic) != Some(committed) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_destination_of() {
        assert_eq!(
            destination_of(br#"{"metadata":{"Destination":"h.db.persons.events"}}"#),
            Some("h.db.persons.events".to_string())
        );
        assert_eq!(destination_of(br#"{"metadata":{"Destination":""}}"#), None);
        assert_eq!(destination_of(br#"{"metadata":{}}"#), None);
        assert_eq!(destination_of(b"not json"), None);
    }

    #[tokio::test]
    async fn test_forwards_body_unmodified_then_commits() {
        let bus = MemoryBus::new();
        let sent = event("h.db.persons.events", 1);
        bus.inject("ingest-queue", sent.clone());

        let cancel = CancellationToken::new();
        let task = {
            let router = router(&bus);
            let receiver = bus.receiver("ingest-queue");
            let cancel = cancel.clone();
            tokio::spawn(async move { router.run(receiver, cancel).await })
        };

        wait_for(&bus, "ingest-queue", 1).await;
        assert_eq!(bus.messages("h.db.persons.events"), vec![sent]);
        assert!(bus.created("h.db.persons.events"));

        cancel.cancel();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats, RouterStats { forwarded: 1, dropped: 0 });
    }

    #[tokio::test]
    async fn test_commit_waits_for_failed_forward() {
        let bus = MemoryBus::new();
        let lanes = RouterSettings::default().forwarders;
        let slow = "h.db.persons.events";
        // A destination served by a different forwarder than `slow`.
        let fast = (0..)
            .map(|i| format!("h.db.t{}.events", i))
            .find(|t| lane_for(t, lanes) != lane_for(slow, lanes))
            .unwrap();
        bus.fail_next_publishes(slow, 3);
        bus.inject("ingest-queue", event(slow, 1));
        bus.inject("ingest-queue", event(&fast, 2));

        let cancel = CancellationToken::new();
        let task = {
            let router = router(&bus);
            let receiver = bus.receiver("ingest-queue");
            let cancel = cancel.clone();
            tokio::spawn(async move { router.run(receiver, cancel).await })
        };

        while bus.messages(&fast).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Offset 1 is forwarded, but offset 0 is still retrying.
        assert_ne!(bus.committed("ingest-queue"), Some(2));

        wait_for(&bus, "ingest-queue", 2).await;
        assert_eq!(bus.publish_attempts(slow), 4);
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_message_without_destination_is_dropped() {
        let bus = MemoryBus::new();
        bus.inject("ingest-queue", Message::new(None, b"{\"metadata\":{}}".to_vec()));
        bus.inject("ingest-queue", event("h.db.persons.events", 1));

        let cancel = CancellationToken::new();
        let task = {
            let router = router(&bus);
            let receiver = bus.receiver("ingest-queue");
            let cancel = cancel.clone();
            tokio::spawn(async move { router.run(receiver, cancel).await })
        };

        wait_for(&bus, "ingest-queue", 2).await;
        cancel.cancel();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats, RouterStats { forwarded: 1, dropped: 1 });
        assert_eq!(bus.messages("h.db.persons.events").len(), 1);
    }

    #[tokio::test]
    async fn test_prewarm_creates_topics() {
        let bus = MemoryBus::new();
        let router = router(&bus);
        router
            .topics()
            .prewarm(vec!["h.db.a.events".to_string(), "h.db.b.events".to_string()])
            .await
            .unwrap();
        assert_eq!(router.topics().len(), 2);
        assert!(bus.created("h.db.a.events"));
        assert!(bus.created("h.db.b.events"));
    }
}
