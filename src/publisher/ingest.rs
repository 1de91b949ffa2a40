//! Stage A of the two-stage publisher: monitors hand their change events to
//! an [`IngestPublisher`], which enriches them, encodes them as JSON and
//! funnels them into the single ingest queue.
//!
//! Submissions from every monitor share one buffer drained by a flusher
//! task. A chunk is sent when `batch_size` messages are buffered or when the
//! oldest buffered submission has waited `flush_interval`. Monitors size
//! their polls per table, but one chunk mixes tables, so chunks are also cut
//! at `max_chunk_bytes` of payload: the sink tier's request limit, the same
//! one the batch sizer divides by row size. The buffer holds at
//! most `buffer_capacity` messages; a full buffer makes `publish_changes`
//! wait, which slows the calling monitor's polling.
//!
//! A submission is acknowledged once every one of its messages is accepted
//! by the transport. If a chunk fails, every submission with messages in that
//! chunk fails and its remaining messages are discarded, so a monitor never
//! sees a partial batch succeed.

use super::{Message, TopicNamer, Transport};
use crate::cdc::{ChangeEvent, SinkLimit};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Completes when the whole submitted batch has been accepted by the bus.
#[derive(Debug)]
pub struct PublishAck {
    rx: oneshot::Receiver<Result<()>>,
}

impl PublishAck {
    pub fn ready() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Self { rx }
    }

    pub async fn wait(self) -> Result<()> {
        self.rx
            .await
            .map_err(|_| Error::Publish("publisher stopped before acknowledging".into()))?
    }
}

/// Entry point monitors use to publish change batches.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    /// Queues a batch; the returned ack resolves once it is on the bus.
    async fn publish_changes(&self, events: Vec<ChangeEvent>) -> Result<PublishAck>;

    /// Flushes what is buffered and releases the transport.
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub ingest_queue: String,
    pub batch_size: usize,
    /// A single message larger than this is still sent, alone.
    pub max_chunk_bytes: usize,
    pub flush_interval: Duration,
    pub buffer_capacity: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            ingest_queue: "ingest-queue".to_string(),
            batch_size: 100,
            max_chunk_bytes: SinkLimit::Standard.max_bytes(),
            flush_interval: Duration::from_millis(100),
            buffer_capacity: 1000,
        }
    }
}

struct Submission {
    messages: VecDeque<Message>,
    ack: oneshot::Sender<Result<()>>,
    arrived: Instant,
    _permit: OwnedSemaphorePermit,
}

pub struct IngestPublisher {
    settings: IngestSettings,
    namer: TopicNamer,
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    tx: parking_lot::Mutex<Option<mpsc::Sender<Submission>>>,
    flusher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl IngestPublisher {
    /// Starts the flusher task. `transport` must be bound to the ingest queue.
    pub fn new(transport: Arc<dyn Transport>, namer: TopicNamer, settings: IngestSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.buffer_capacity.max(1));
        let flusher = tokio::spawn(run_flusher(
            Arc::clone(&transport),
            rx,
            ChunkLimits {
                messages: settings.batch_size.max(1),
                bytes: settings.max_chunk_bytes,
            },
            settings.flush_interval,
        ));

        Self {
            permits: Arc::new(Semaphore::new(settings.buffer_capacity.max(1))),
            settings,
            namer,
            transport,
            tx: parking_lot::Mutex::new(Some(tx)),
            flusher: tokio::sync::Mutex::new(Some(flusher)),
        }
    }

    fn encode(&self, mut event: ChangeEvent) -> Result<Message> {
        let table = event.metadata.table_name.clone();
        event.metadata.destination = Some(self.namer.topic(&table));
        event.metadata.ingest_queue = Some(self.settings.ingest_queue.clone());
        Ok(Message::new(Some(table), event.to_json()?))
    }
}

#[async_trait]
impl ChangePublisher for IngestPublisher {
    async fn publish_changes(&self, events: Vec<ChangeEvent>) -> Result<PublishAck> {
        if events.is_empty() {
            return Ok(PublishAck::ready());
        }

        let messages = events
            .into_iter()
            .map(|event| self.encode(event))
            .collect::<Result<VecDeque<_>>>()?;

        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| Error::Publish("publisher is closed".into()))?;

        // Oversized batches take the whole buffer rather than deadlocking.
        let wanted = messages.len().min(self.settings.buffer_capacity.max(1)) as u32;
        let permit = Arc::clone(&self.permits)
            .acquire_many_owned(wanted)
            .await
            .map_err(|_| Error::Publish("publisher is closed".into()))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Submission {
            messages,
            ack: ack_tx,
            arrived: Instant::now(),
            _permit: permit,
        })
        .await
        .map_err(|_| Error::Publish("publisher is closed".into()))?;

        Ok(PublishAck { rx: ack_rx })
    }

    async fn close(&self) -> Result<()> {
        drop(self.tx.lock().take());
        if let Some(flusher) = self.flusher.lock().await.take() {
            if let Err(e) = flusher.await {
                error!("Ingest flusher task failed: {}", e);
            }
        }
        self.transport.close().await?;
        info!(queue = %self.settings.ingest_queue, "Ingest publisher closed");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct ChunkLimits {
    messages: usize,
    bytes: usize,
}

impl ChunkLimits {
    /// Whether a `next`-byte message fits a chunk holding `count` messages
    /// of `size` bytes. An empty chunk takes anything.
    fn fits(&self, count: usize, size: usize, next: usize) -> bool {
        count == 0 || (count < self.messages && size + next <= self.bytes)
    }
}

async fn run_flusher(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::Receiver<Submission>,
    limits: ChunkLimits,
    flush_interval: Duration,
) {
    let mut buffer: VecDeque<Submission> = VecDeque::new();
    let mut buffered = 0usize;

    loop {
        let deadline = buffer.front().map(|s| s.arrived + flush_interval);
        tokio::select! {
            received = rx.recv() => match received {
                Some(submission) => {
                    buffered += submission.messages.len();
                    buffer.push_back(submission);
                    while buffered >= limits.messages {
                        flush_chunk(transport.as_ref(), &mut buffer, &mut buffered, limits).await;
                    }
                }
                None => break,
            },
            _ = sleep_until_opt(deadline) => {
                while buffered > 0 {
                    flush_chunk(transport.as_ref(), &mut buffer, &mut buffered, limits).await;
                }
            }
        }
    }

    while buffered > 0 {
        flush_chunk(transport.as_ref(), &mut buffer, &mut buffered, limits).await;
    }
    debug!("Ingest flusher stopped");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Sends one chunk taken from the front submissions, within `limits`.
async fn flush_chunk(
    transport: &dyn Transport,
    buffer: &mut VecDeque<Submission>,
    buffered: &mut usize,
    limits: ChunkLimits,
) {
    let mut chunk = Vec::with_capacity(limits.messages.min(*buffered));
    let mut bytes = 0;
    // Submissions that contributed to this chunk.
    let mut touched = 0;
    'fill: for (i, submission) in buffer.iter_mut().enumerate() {
        while let Some(next) = submission.messages.front() {
            let size = next.payload.len();
            if !limits.fits(chunk.len(), bytes, size) {
                break 'fill;
            }
            bytes += size;
            chunk.extend(submission.messages.pop_front());
            touched = i + 1;
        }
    }
    let sent = chunk.len();
    *buffered -= sent;

    match transport.publish_batch(chunk).await {
        Ok(()) => {
            debug!(messages = sent, bytes, "Flushed ingest chunk");
            while buffer.front().is_some_and(|s| s.messages.is_empty()) {
                if let Some(done) = buffer.pop_front() {
                    let _ = done.ack.send(Ok(()));
                }
            }
        }
        Err(e) => {
            warn!(messages = sent, error = %e, "Ingest chunk failed");
            for failed in buffer.drain(..touched) {
                *buffered -= failed.messages.len();
                let _ = failed.ack.send(Err(Error::Publish(e.to_string())));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::{ChangeRow, Lsn};
    use crate::publisher::MemoryBus;

    fn event(table: &str, lsn: u64) -> ChangeEvent {
        let row = ChangeRow::new(Lsn::from_u64(lsn), 1, 2, vec![Some(lsn.to_string())]);
        ChangeEvent::from_row(table, &["ID".to_string()], &row)
            .unwrap()
            .unwrap()
    }

    fn publisher(bus: &MemoryBus, batch_size: usize) -> IngestPublisher {
        IngestPublisher::new(
            Arc::new(bus.transport("ingest-queue")),
            TopicNamer::new("h", "testdb"),
            IngestSettings {
                batch_size,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_enriches_and_keys_by_table() {
        let bus = MemoryBus::new();
        let publisher = publisher(&bus, 100);

        let ack = publisher
            .publish_changes(vec![event("Persons", 1), event("Persons", 2)])
            .await
            .unwrap();
        ack.wait().await.unwrap();

        let messages = bus.messages("ingest-queue");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].key.as_deref(), Some("Persons"));
        let body: serde_json::Value = serde_json::from_slice(&messages[1].payload).unwrap();
        assert_eq!(body["metadata"]["Destination"], "h.testdb.persons.events");
        assert_eq!(body["metadata"]["IngestQueue"], "ingest-queue");
        assert_eq!(body["metadata"]["LSN"], "00000000000000000002");
        publisher.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_waits_for_interval() {
        let bus = MemoryBus::new();
        let publisher = publisher(&bus, 100);

        let ack = publisher.publish_changes(vec![event("Cars", 1)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bus.messages("ingest-queue").is_empty());

        ack.wait().await.unwrap();
        assert_eq!(bus.messages("ingest-queue").len(), 1);
    }

    #[tokio::test]
    async fn test_large_batch_is_chunked_in_order() {
        let bus = MemoryBus::new();
        let publisher = publisher(&bus, 3);

        let events = (1..=7).map(|i| event("Persons", i)).collect();
        publisher.publish_changes(events).await.unwrap().wait().await.unwrap();

        assert_eq!(bus.publish_attempts("ingest-queue"), 3);
        let lsns: Vec<String> = bus
            .messages("ingest-queue")
            .iter()
            .map(|m| {
                let v: serde_json::Value = serde_json::from_slice(&m.payload).unwrap();
                v["metadata"]["LSN"].as_str().unwrap().to_string()
            })
            .collect();
        let mut sorted = lsns.clone();
        sorted.sort();
        assert_eq!(lsns, sorted);
        assert_eq!(lsns.len(), 7);
    }

    #[tokio::test]
    async fn test_chunks_stay_under_byte_limit() {
        let bus = MemoryBus::new();
        let sizing = IngestPublisher::new(
            Arc::new(bus.transport("sizing")),
            TopicNamer::new("h", "testdb"),
            IngestSettings::default(),
        );
        sizing.publish_changes(vec![event("Persons", 1)]).await.unwrap().wait().await.unwrap();
        let size = bus.messages("sizing")[0].payload.len();

        // Room for two messages per chunk, far below the count limit.
        let publisher = IngestPublisher::new(
            Arc::new(bus.transport("ingest-queue")),
            TopicNamer::new("h", "testdb"),
            IngestSettings {
                batch_size: 100,
                max_chunk_bytes: size * 2 + size / 2,
                ..Default::default()
            },
        );
        let events = (1..=5).map(|i| event("Persons", i)).collect();
        publisher.publish_changes(events).await.unwrap().wait().await.unwrap();

        assert_eq!(bus.publish_attempts("ingest-queue"), 3);
        assert_eq!(bus.messages("ingest-queue").len(), 5);
    }

    #[test]
    fn test_oversized_message_goes_alone() {
        let limits = ChunkLimits {
            messages: 10,
            bytes: 100,
        };
        assert!(limits.fits(0, 0, 500));
        assert!(!limits.fits(1, 10, 500));
        assert!(limits.fits(1, 10, 90));
        assert!(!limits.fits(10, 10, 1));
    }

    #[tokio::test]
    async fn test_failed_chunk_fails_whole_submission() {
        let bus = MemoryBus::new();
        let publisher = publisher(&bus, 2);
        bus.fail_next_publishes("ingest-queue", 1);

        let ack = publisher
            .publish_changes((1..=5).map(|i| event("Persons", i)).collect())
            .await
            .unwrap();
        assert!(matches!(ack.wait().await, Err(Error::Publish(_))));
        // Nothing after the failed chunk was sent.
        assert_eq!(bus.publish_attempts("ingest-queue"), 1);
        assert!(bus.messages("ingest-queue").is_empty());

        publisher
            .publish_changes(vec![event("Persons", 1), event("Persons", 2)])
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(bus.messages("ingest-queue").len(), 2);
    }

    #[tokio::test]
    async fn test_close_flushes_and_rejects_new_work() {
        let bus = MemoryBus::new();
        let publisher = publisher(&bus, 100);
        let ack = publisher.publish_changes(vec![event("Cars", 1)]).await.unwrap();
        publisher.close().await.unwrap();
        ack.wait().await.unwrap();
        assert_eq!(bus.messages("ingest-queue").len(), 1);
        assert!(publisher.publish_changes(vec![event("Cars", 2)]).await.is_err());
    }
}
