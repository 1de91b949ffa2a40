use super::backoff::Backoff;
use super::batch_sizer::{BatchSizer, BatchSizerSettings};
use super::checkpoint::CheckpointStore;
use super::source::ChangeSource;
use super::types::{ChangeEvent, ChangeRow, TableDescriptor};
use super::Lsn;
use crate::publisher::ChangePublisher;
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Cursor for tables without a checkpoint.
    pub start_lsn: Lsn,
    pub jitter: bool,
    pub max_consecutive_failures: u32,
    pub sizer: BatchSizerSettings,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            start_lsn: Lsn::ZERO,
            jitter: false,
            max_consecutive_failures: 10,
            sizer: BatchSizerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing newer than the cursor.
    Empty,
    /// Rows up to `lsn` were published and checkpointed. `published` can be
    /// zero when every row was an update before-image.
    Advanced { published: usize, lsn: Lsn },
}

/// Polls one table's change log and publishes what it finds.
pub struct TableMonitor {
    table: TableDescriptor,
    source: Arc<dyn ChangeSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    publisher: Arc<dyn ChangePublisher>,
    sizer: Arc<BatchSizer>,
    settings: MonitorSettings,
    columns: Vec<String>,
    cursor: parking_lot::Mutex<Lsn>,
}

impl TableMonitor {
    /// Loads the checkpoint, discovers columns and takes a first size sample.
    pub async fn start(
        table: TableDescriptor,
        source: Arc<dyn ChangeSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        publisher: Arc<dyn ChangePublisher>,
        settings: MonitorSettings,
    ) -> Result<Self> {
        checkpoints.initialize().await?;
        let cursor = checkpoints.load(&table.name, settings.start_lsn).await?;
        let columns = source.columns(&table).await?;

        let sizer = Arc::new(BatchSizer::new(
            Arc::clone(&source),
            table.clone(),
            columns.clone(),
            settings.sizer.clone(),
        ));
        if let Err(e) = sizer.sample().await {
            if !e.is_transient() {
                return Err(e);
            }
            warn!(table = %table.name, error = %e, "Initial batch size sample failed, using default");
        }

        info!(
            table = %table.name,
            lsn = %cursor,
            columns = columns.len(),
            batch_size = sizer.current(),
            destination = %table.destination,
            "Monitor ready"
        );

        Ok(Self {
            table,
            source,
            checkpoints,
            publisher,
            sizer,
            settings,
            columns,
            cursor: parking_lot::Mutex::new(cursor),
        })
    }

    pub fn table(&self) -> &TableDescriptor {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn cursor(&self) -> Lsn {
        *self.cursor.lock()
    }

    pub fn batch_sizer(&self) -> &Arc<BatchSizer> {
        &self.sizer
    }

    /// Polls until `cancel` fires or a fatal error occurs.
    ///
    /// Transient errors back off like empty polls and are tolerated up to
    /// `max_consecutive_failures` in a row.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let sizer_cancel = cancel.child_token();
        let _stop_sizer = sizer_cancel.clone().drop_guard();
        self.sizer.spawn(sizer_cancel);

        let mut backoff = Backoff::new(self.table.poll_interval, self.table.max_poll_interval)
            .with_jitter(self.settings.jitter);
        let mut failures = 0u32;

        loop {
            let delay = backoff.delay();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.poll_once(&cancel).await {
                Ok(PollOutcome::Empty) => {
                    failures = 0;
                    backoff.grow();
                    debug!(table = %self.table.name, next_poll = ?backoff.current(), "No changes");
                }
                Ok(PollOutcome::Advanced { published, lsn }) => {
                    failures = 0;
                    backoff.reset();
                    info!(table = %self.table.name, published, lsn = %lsn, "Published changes");
                }
                Err(Error::Shutdown) => break,
                Err(e) if e.is_transient() => {
                    failures += 1;
                    warn!(
                        table = %self.table.name,
                        failures,
                        error = %e,
                        "Poll failed"
                    );
                    if failures >= self.settings.max_consecutive_failures {
                        error!(table = %self.table.name, "Too many consecutive failures");
                        return Err(Error::RetryExhausted {
                            attempts: failures,
                            last: e.to_string(),
                        });
                    }
                    backoff.grow();
                }
                Err(e) => {
                    error!(table = %self.table.name, error = %e, "Monitor stopped on fatal error");
                    return Err(e);
                }
            }
        }

        info!(table = %self.table.name, lsn = %self.cursor(), "Monitor stopped");
        Ok(())
    }

    /// One fetch, publish and checkpoint cycle.
    ///
    /// Cancellation is honoured only while fetching. Once rows are in hand
    /// the batch is published, acknowledged and checkpointed before
    /// returning, or the cycle fails and the cursor stays put.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<PollOutcome> {
        let cursor = self.cursor();
        let limit = self.sizer.current().max(1);

        let rows = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Shutdown),
            rows = self.fetch_batch(cursor, limit) => rows?,
        };

        let Some(last) = rows.last() else {
            return Ok(PollOutcome::Empty);
        };
        let max_lsn = last.lsn;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(event) = ChangeEvent::from_row(&self.table.name, &self.columns, row)? {
                events.push(event);
            }
        }
        let published = events.len();

        if published > 0 {
            let ack = self.publisher.publish_changes(events).await?;
            ack.wait().await?;
        }

        self.checkpoints.save(&self.table.name, max_lsn).await?;
        *self.cursor.lock() = max_lsn;

        Ok(PollOutcome::Advanced {
            published,
            lsn: max_lsn,
        })
    }

    /// Rows after `cursor` in emission order, never splitting an LSN group.
    ///
    /// A full batch may have been cut inside its last LSN; that trailing group
    /// is left for the next poll. When the whole batch is one LSN, the group
    /// is read in full instead.
    async fn fetch_batch(&self, cursor: Lsn, limit: usize) -> Result<Vec<ChangeRow>> {
        let mut rows = self
            .with_query_timeout(
                "fetch changes",
                self.source
                    .fetch_changes(&self.table, &self.columns, cursor, limit),
            )
            .await?;

        rows.sort_by(|a, b| (a.lsn, &a.seqval).cmp(&(b.lsn, &b.seqval)));
        rows.retain(|row| row.lsn > cursor);

        if rows.len() < limit {
            return Ok(rows);
        }

        let (first, last) = match (rows.first(), rows.last()) {
            (Some(first), Some(last)) => (first.lsn, last.lsn),
            _ => return Ok(rows),
        };

        if first == last {
            let mut group = self
                .with_query_timeout(
                    "fetch lsn group",
                    self.source.fetch_lsn_group(&self.table, &self.columns, last),
                )
                .await?;
            group.sort_by(|a, b| a.seqval.cmp(&b.seqval));
            debug!(table = %self.table.name, lsn = %last, rows = group.len(), "Read full LSN group");
            return Ok(group);
        }

        let complete = rows.partition_point(|row| row.lsn < last);
        rows.truncate(complete);
        Ok(rows)
    }

    async fn with_query_timeout<T>(
        &self,
        what: &str,
        query: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.table.max_poll_interval, query)
            .await
            .map_err(|_| Error::timeout(format!("{} for {}", what, self.table.name)))?
    }
}
