use super::{Message, Transport};
use crate::router::{IngestDelivery, IngestReceiver};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Vec<Message>>,
    created: HashSet<String>,
    failures: HashMap<String, u32>,
    attempts: HashMap<String, u32>,
    commits: HashMap<String, i64>,
}

/// In-process bus with one partition per topic, for tests and local runs.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            version: Arc::new(version),
        }
    }

    pub fn transport(&self, destination: &str) -> MemoryTransport {
        MemoryTransport {
            bus: self.clone(),
            destination: destination.to_string(),
        }
    }

    /// Consumer of `topic` resuming after its last committed offset.
    pub fn receiver(&self, topic: &str) -> MemoryIngestReceiver {
        let next = self.committed(topic).unwrap_or(0);
        MemoryIngestReceiver {
            bus: self.clone(),
            topic: topic.to_string(),
            next,
            changes: self.version.subscribe(),
        }
    }

    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.state
            .lock()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Appends directly to a topic, bypassing failure injection.
    pub fn inject(&self, topic: &str, message: Message) {
        self.state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(message);
        self.version.send_modify(|v| *v += 1);
    }

    /// Makes the next `count` batch publishes to `topic` fail.
    pub fn fail_next_publishes(&self, topic: &str, count: u32) {
        self.state.lock().failures.insert(topic.to_string(), count);
    }

    /// Number of `publish_batch` calls made against `topic`, failed ones included.
    pub fn publish_attempts(&self, topic: &str) -> u32 {
        self.state.lock().attempts.get(topic).copied().unwrap_or(0)
    }

    /// Next offset to read, as last committed by a receiver.
    pub fn committed(&self, topic: &str) -> Option<i64> {
        self.state.lock().commits.get(topic).copied()
    }

    pub fn created(&self, topic: &str) -> bool {
        self.state.lock().created.contains(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }
}

pub struct MemoryTransport {
    bus: MemoryBus,
    destination: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn create(&self, destination: &str) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(self.bus.transport(destination)))
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> Result<()> {
        {
            let mut state = self.bus.state.lock();
            *state.attempts.entry(self.destination.clone()).or_default() += 1;
            if let Some(remaining) = state.failures.get_mut(&self.destination) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Publish(format!(
                        "injected failure publishing to '{}'",
                        self.destination
                    )));
                }
            }
            state
                .topics
                .entry(self.destination.clone())
                .or_default()
                .extend(messages);
        }
        self.bus.version.send_modify(|v| *v += 1);
        Ok(())
    }

    async fn ensure_destination_exists(&self, destination: &str) -> Result<()> {
        self.bus.state.lock().created.insert(destination.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Reads one memory topic as partition 0.
pub struct MemoryIngestReceiver {
    bus: MemoryBus,
    topic: String,
    next: i64,
    changes: watch::Receiver<u64>,
}

#[async_trait]
impl IngestReceiver for MemoryIngestReceiver {
    async fn receive(&mut self) -> Result<Option<IngestDelivery>> {
        loop {
            self.changes.borrow_and_update();
            let message = {
                let state = self.bus.state.lock();
                state
                    .topics
                    .get(&self.topic)
                    .and_then(|messages| messages.get(self.next as usize))
                    .cloned()
            };
            if let Some(message) = message {
                let offset = self.next;
                self.next += 1;
                return Ok(Some(IngestDelivery {
                    partition: 0,
                    offset,
                    key: message.key,
                    payload: message.payload,
                }));
            }
            if self.changes.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, _partition: i32, next_offset: i64) -> Result<()> {
        let mut state = self.bus.state.lock();
        let committed = state.commits.entry(self.topic.clone()).or_insert(0);
        *committed = (*committed).max(next_offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive_in_order() {
        let bus = MemoryBus::new();
        let transport = bus.transport("q");
        transport
            .publish_batch(vec![
                Message::new(None, b"a".to_vec()),
                Message::new(None, b"b".to_vec()),
            ])
            .await
            .unwrap();

        let mut receiver = bus.receiver("q");
        let first = receiver.receive().await.unwrap().unwrap();
        let second = receiver.receive().await.unwrap().unwrap();
        assert_eq!((first.offset, &first.payload[..]), (0, &b"a"[..]));
        assert_eq!((second.offset, &second.payload[..]), (1, &b"b"[..]));

        receiver.commit(0, 2).await.unwrap();
        assert_eq!(bus.committed("q"), Some(2));
    }

    #[tokio::test]
    async fn test_injected_failures_do_not_append() {
        let bus = MemoryBus::new();
        bus.fail_next_publishes("q", 1);
        let transport = bus.transport("q");
        assert!(transport
            .publish_batch(vec![Message::new(None, b"a".to_vec())])
            .await
            .is_err());
        assert!(bus.messages("q").is_empty());
        transport
            .publish_batch(vec![Message::new(None, b"a".to_vec())])
            .await
            .unwrap();
        assert_eq!(bus.messages("q").len(), 1);
        assert_eq!(bus.publish_attempts("q"), 2);
    }

    #[tokio::test]
    async fn test_receive_waits_for_new_messages() {
        let bus = MemoryBus::new();
        let mut receiver = bus.receiver("q");
        let waiter = tokio::spawn(async move { receiver.receive().await });
        tokio::task::yield_now().await;
        bus.inject("q", Message::new(None, b"late".to_vec()));
        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(&delivery.payload[..], b"late");
    }
}
