//! Wires the configured source, stores, lock backend and bus together and
//! runs the orchestrator until cancelled.

use crate::cdc::{
    BatchSizerSettings, CheckpointStore, FileCheckpointStore, Lsn, MonitorFactory,
    MonitorSettings, Orchestrator, OrchestratorReport, PgChangeSource, PgCheckpointStore,
    TableSpec,
};
use crate::config::{CheckpointConfig, Config, IngesterConfig, LockBackend};
use crate::locking::{Locker, MemoryLocker, PgLocker};
use crate::publisher::{self, ChangePublisher, IngestPublisher, IngestSettings, TopicNamer};
use crate::db::{self, Database};
use crate::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Monitor settings derived from the `[ingester]` section.
pub fn monitor_settings(config: &IngesterConfig) -> Result<MonitorSettings> {
    let start_lsn = match &config.start_lsn {
        Some(hex) => hex
            .parse::<Lsn>()
            .map_err(|e| Error::Config(format!("ingester.start_lsn: {}", e)))?,
        None => Lsn::ZERO,
    };

    Ok(MonitorSettings {
        start_lsn,
        jitter: config.poll_jitter,
        max_consecutive_failures: config.max_consecutive_failures,
        sizer: BatchSizerSettings {
            sink_limit: config.sink_limit,
            sample_rows: config.sample_rows,
            resample_interval: config.resample_interval(),
            ingest_queue: config.ingest_queue.clone(),
            ..Default::default()
        },
    })
}

pub fn table_specs(config: &IngesterConfig) -> Vec<TableSpec> {
    config
        .tables
        .iter()
        .map(|table| {
            let (poll_interval, max_poll_interval) = config.poll_intervals(table);
            TableSpec {
                name: table.name.clone(),
                poll_interval,
                max_poll_interval,
            }
        })
        .collect()
}

pub fn ingest_settings(config: &IngesterConfig) -> IngestSettings {
    IngestSettings {
        ingest_queue: config.ingest_queue.clone(),
        batch_size: config.batch_size,
        max_chunk_bytes: config.sink_limit.max_bytes(),
        flush_interval: config.batch_flush_interval(),
        buffer_capacity: config.buffer_capacity,
    }
}

pub struct Ingester {
    config: Config,
}

impl Ingester {
    pub fn new(config: Config) -> Result<Self> {
        config.ingester()?;
        Ok(Self { config })
    }

    /// Runs monitors for every table this worker can claim. Returns once all
    /// of them have stopped, with leases released.
    pub async fn run(&self, cancel: CancellationToken) -> Result<OrchestratorReport> {
        let ingester = self.config.ingester()?;
        let settings = monitor_settings(ingester)?;
        let namer = TopicNamer::from_connection_string(&ingester.db_connection_string)?;

        let db = db::connect(&ingester.db_connection_string).await?;
        let checkpoints = checkpoint_store(ingester, &db);
        let locker = self.locker(ingester, &db).await?;

        let transport = publisher::build_transport(
            &self.config.publisher,
            &ingester.ingest_queue,
            ingester.publish_timeout(),
        )?;
        transport
            .ensure_destination_exists(&ingester.ingest_queue)
            .await?;
        let publisher = Arc::new(IngestPublisher::new(
            transport,
            namer.clone(),
            ingest_settings(ingester),
        ));

        let factory = Arc::new(MonitorFactory {
            source: Arc::new(PgChangeSource::new(db.clone())),
            checkpoints,
            publisher: publisher.clone(),
            namer,
            schema: ingester.schema.clone(),
            capture_schema: ingester.capture_schema.clone(),
            settings,
        });

        info!(
            tables = ingester.tables.len(),
            ingest_queue = %ingester.ingest_queue,
            "Starting ingester"
        );
        let orchestrator = Orchestrator::new(
            locker,
            factory,
            table_specs(ingester),
            ingester.stagger(),
        );
        let report = orchestrator.run(cancel).await;

        if let Err(e) = publisher.close().await {
            warn!(error = %e, "Failed to close publisher");
        }

        let report = report?;
        info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            lost = report.lost.len(),
            "Ingester stopped"
        );
        Ok(report)
    }

    async fn locker(
        &self,
        ingester: &IngesterConfig,
        source: &Database,
    ) -> Result<Arc<dyn Locker>> {
        let timing = ingester.locks.timing();
        match &ingester.locks.backend {
            LockBackend::Postgres { table, .. } => {
                let conn = ingester
                    .lock_connection_string()
                    .unwrap_or(&ingester.db_connection_string);
                let db = if conn == ingester.db_connection_string {
                    source.clone()
                } else {
                    db::connect(conn).await?
                };
                let locker = PgLocker::new(db, table, timing);
                locker.initialize().await?;
                Ok(Arc::new(locker))
            }
            LockBackend::Memory => {
                warn!("Using in-process leases; other workers will not see them");
                Ok(Arc::new(MemoryLocker::new(timing)))
            }
        }
    }
}

fn checkpoint_store(ingester: &IngesterConfig, source: &Database) -> Arc<dyn CheckpointStore> {
    match &ingester.checkpoint {
        CheckpointConfig::Database => Arc::new(PgCheckpointStore::new(source.clone())),
        CheckpointConfig::File { path } => Arc::new(FileCheckpointStore::new(path)),
    }
}
