use super::source::ChangeSource;
use super::types::{ChangeEvent, TableDescriptor};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_BUFFER_FACTOR: f64 = 0.2;

/// Maximum message size accepted by the sink tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkLimit {
    #[default]
    Standard,
    Premium,
}

impl SinkLimit {
    pub fn max_bytes(&self) -> usize {
        match self {
            SinkLimit::Standard => 256 * 1024,
            SinkLimit::Premium => 1024 * 1024,
        }
    }

    /// Fixed batch size for the tier; quantized so polling does not flap.
    pub fn batch_size(&self) -> usize {
        match self {
            SinkLimit::Standard => 100,
            SinkLimit::Premium => 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchSizerSettings {
    pub sink_limit: SinkLimit,
    pub sample_rows: usize,
    pub buffer_factor: f64,
    pub resample_interval: Duration,
    /// Ingest queue name, included so samples match the enriched wire form.
    pub ingest_queue: String,
}

impl Default for BatchSizerSettings {
    fn default() -> Self {
        Self {
            sink_limit: SinkLimit::Standard,
            sample_rows: 100,
            buffer_factor: DEFAULT_BUFFER_FACTOR,
            resample_interval: Duration::from_secs(3600),
            ingest_queue: "ingest-queue".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSizerMetrics {
    pub current_batch_size: usize,
    pub last_sample_time: Option<DateTime<Utc>>,
    pub last_sample_size: usize,
    pub avg_row_size: u64,
    pub sample_count: u64,
}

/// Picks how many change rows a poll may read for one table.
pub struct BatchSizer {
    source: Arc<dyn ChangeSource>,
    table: TableDescriptor,
    columns: Vec<String>,
    settings: BatchSizerSettings,
    current: AtomicUsize,
    avg_row_size: AtomicU64,
    last_sample_size: AtomicUsize,
    sample_count: AtomicU64,
    last_sample_time: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl BatchSizer {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        table: TableDescriptor,
        columns: Vec<String>,
        settings: BatchSizerSettings,
    ) -> Self {
        let initial = settings.sink_limit.batch_size();
        Self {
            source,
            table,
            columns,
            settings,
            current: AtomicUsize::new(initial),
            avg_row_size: AtomicU64::new(0),
            last_sample_size: AtomicUsize::new(0),
            sample_count: AtomicU64::new(0),
            last_sample_time: parking_lot::Mutex::new(None),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Batch size for an average encoded row of `avg_row_size` bytes.
    pub fn compute(limit: SinkLimit, buffer_factor: f64, avg_row_size: f64) -> usize {
        let tier = limit.batch_size();
        if avg_row_size <= 0.0 {
            return tier;
        }
        let effective = avg_row_size * (1.0 + buffer_factor);
        let fits = ((limit.max_bytes() as f64) / effective).floor() as usize;
        tier.min(fits.max(1))
    }

    /// Samples recent rows and stores the new batch size.
    pub async fn sample(&self) -> Result<usize> {
        let rows = self
            .source
            .sample(&self.table, &self.columns, self.settings.sample_rows)
            .await?;

        let mut total = 0usize;
        let mut counted = 0usize;
        for row in &rows {
            let Some(mut event) = ChangeEvent::from_row(&self.table.name, &self.columns, row)? else {
                continue;
            };
            event.metadata.destination = Some(self.table.destination.clone());
            event.metadata.ingest_queue = Some(self.settings.ingest_queue.clone());
            total += event.to_json()?.len();
            counted += 1;
        }

        let avg = if counted == 0 {
            0.0
        } else {
            total as f64 / counted as f64
        };
        let size = Self::compute(self.settings.sink_limit, self.settings.buffer_factor, avg);

        self.current.store(size, Ordering::Release);
        self.avg_row_size.store(avg.round() as u64, Ordering::Relaxed);
        self.last_sample_size.store(counted, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
        *self.last_sample_time.lock() = Some(Utc::now());

        debug!(
            table = %self.table.name,
            sampled = counted,
            avg_row_size = avg,
            batch_size = size,
            "Batch size sampled"
        );
        Ok(size)
    }

    pub fn metrics(&self) -> BatchSizerMetrics {
        BatchSizerMetrics {
            current_batch_size: self.current(),
            last_sample_time: *self.last_sample_time.lock(),
            last_sample_size: self.last_sample_size.load(Ordering::Relaxed),
            avg_row_size: self.avg_row_size.load(Ordering::Relaxed),
            sample_count: self.sample_count.load(Ordering::Relaxed),
        }
    }

    /// Resamples every `resample_interval` until cancelled. A failed sample
    /// keeps the previous size.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let sizer = Arc::clone(self);
        tokio::spawn(async move {
            let period = sizer.settings.resample_interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                match sizer.sample().await {
                    Ok(size) => info!(table = %sizer.table.name, batch_size = size, "Batch size resampled"),
                    Err(e) => warn!(table = %sizer.table.name, error = %e, "Batch size resample failed"),
                }
            }
        })
    }
}
