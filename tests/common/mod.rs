#![allow(dead_code)]

use dstream::cdc::{
    ChangeRow, Lsn, MemoryChangeSource, MemoryCheckpointStore, MonitorFactory, MonitorSettings,
    Orchestrator, TableSpec,
};
use dstream::locking::{LeaseTiming, MemoryLocker};
use dstream::publisher::{IngestPublisher, IngestSettings, MemoryBus, TopicNamer};
use dstream::router::{Router, RouterSettings};
use serde_json::Value;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const INGEST_QUEUE: &str = "ingest-queue";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("dstream=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Source database for the ignored live tests.
pub fn pg_test_url() -> String {
    env::var("TEST_PG_URL").unwrap_or_else(|_| {
        "host=localhost port=5432 dbname=testdb user=postgres password=postgres".to_string()
    })
}

pub fn kafka_test_brokers() -> Vec<String> {
    env::var("TEST_KAFKA_BROKERS")
        .unwrap_or_else(|_| "localhost:9092".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .collect()
}

/// Everything several workers share: one change log, one checkpoint store,
/// one bus and one lock space.
pub struct Cluster {
    pub source: MemoryChangeSource,
    pub checkpoints: MemoryCheckpointStore,
    pub bus: MemoryBus,
    pub locks: MemoryLocker,
    pub namer: TopicNamer,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            source: MemoryChangeSource::new(),
            checkpoints: MemoryCheckpointStore::new(),
            bus: MemoryBus::new(),
            locks: MemoryLocker::new(LeaseTiming::default()),
            namer: TopicNamer::new("h", "testdb"),
        }
    }

    /// A CDC-enabled table holding `rows` inserts at LSNs `1..=rows`.
    pub fn add_table(&self, name: &str, rows: u64) {
        self.source.add_table(name, &["ID", "Name"]);
        for lsn in 1..=rows {
            self.source.push(
                name,
                ChangeRow::new(
                    Lsn::from_u64(lsn),
                    1,
                    2,
                    vec![Some(lsn.to_string()), Some(format!("{} {}", name, lsn))],
                ),
            );
        }
    }

    /// A worker process: its own publisher and lock identity, shared state.
    pub fn worker(&self, tables: &[&str]) -> Orchestrator {
        let publisher = Arc::new(IngestPublisher::new(
            Arc::new(self.bus.transport(INGEST_QUEUE)),
            self.namer.clone(),
            IngestSettings {
                flush_interval: Duration::from_millis(1),
                ..Default::default()
            },
        ));
        let factory = Arc::new(MonitorFactory {
            source: Arc::new(self.source.clone()),
            checkpoints: Arc::new(self.checkpoints.clone()),
            publisher,
            namer: self.namer.clone(),
            schema: "dbo".into(),
            capture_schema: "cdc".into(),
            settings: MonitorSettings::default(),
        });
        let specs = tables
            .iter()
            .map(|name| TableSpec {
                name: name.to_string(),
                poll_interval: Duration::from_secs(1),
                max_poll_interval: Duration::from_secs(8),
            })
            .collect();
        Orchestrator::new(
            Arc::new(self.locks.peer()),
            factory,
            specs,
            Duration::from_millis(500),
        )
    }

    pub fn router(&self) -> Router {
        Router::new(
            Arc::new(self.bus.transport(INGEST_QUEUE)),
            RouterSettings::default(),
        )
    }

    /// Decoded events on `topic`, in bus order.
    pub fn events(&self, topic: &str) -> Vec<Value> {
        self.bus
            .messages(topic)
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).expect("event is JSON"))
            .collect()
    }

    pub fn topic(&self, table: &str) -> String {
        self.namer.topic(table)
    }
}

pub fn lsn_of(event: &Value) -> String {
    event["metadata"]["LSN"]
        .as_str()
        .expect("event has an LSN")
        .to_string()
}

pub fn table_of(event: &Value) -> String {
    event["metadata"]["TableName"]
        .as_str()
        .expect("event has a table name")
        .to_string()
}

/// Polls `condition` on tokio's clock, so it also works with paused time.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(120);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
