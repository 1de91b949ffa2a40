//! Checkpoint persistence for at-least-once delivery.
//!
//! A checkpoint is the last LSN a monitor has published and had acknowledged
//! for a table. Monitors resume strictly after it, so a crash between publish
//! and save replays at most one batch.
//!
//! Three stores are provided:
//!
//! - [`PgCheckpointStore`]: the `cdc_offsets` table next to the source.
//! - [`FileCheckpointStore`]: a JSON document written atomically.
//! - [`MemoryCheckpointStore`]: in-process, for tests and dry runs.
//!
//! Every store refuses to move a table's LSN backwards.
//!
//! # Example
//!
//! ```rust,no_run
//! use dstream::cdc::{CheckpointStore, FileCheckpointStore, Lsn};
//!
//! #[tokio::main]
//! async fn main() -> dstream::Result<()> {
//!     let store = FileCheckpointStore::new("checkpoints.json");
//!     store.initialize().await?;
//!
//!     let lsn = store.load("Persons", Lsn::ZERO).await?;
//!     println!("Resuming Persons after {}", lsn);
//!
//!     store.save("Persons", Lsn::from_u64(42)).await?;
//!     Ok(())
//! }
//! ```

use super::Lsn;
use crate::db::Database;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Durable `table -> last LSN` mapping.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Creates the backing storage if absent. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Returns the stored LSN for `table`, or `default` on first use.
    async fn load(&self, table: &str, default: Lsn) -> Result<Lsn>;

    /// Upserts the LSN for `table` in a single atomic step.
    ///
    /// A failed save must leave the caller's cursor where it was. Stores do
    /// not retry internally.
    async fn save(&self, table: &str, lsn: Lsn) -> Result<()>;
}

const CREATE_OFFSETS: &str = "CREATE TABLE IF NOT EXISTS cdc_offsets (
    table_name TEXT PRIMARY KEY,
    last_lsn BYTEA NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

const UPSERT_OFFSET: &str = "INSERT INTO cdc_offsets (table_name, last_lsn, updated_at)
VALUES ($1, $2, now())
ON CONFLICT (table_name) DO UPDATE
    SET last_lsn = EXCLUDED.last_lsn, updated_at = EXCLUDED.updated_at
    WHERE cdc_offsets.last_lsn <= EXCLUDED.last_lsn";

/// Checkpoints in the `cdc_offsets` table.
pub struct PgCheckpointStore {
    db: Database,
}

impl PgCheckpointStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn initialize(&self) -> Result<()> {
        self.db.client().await?.batch_execute(CREATE_OFFSETS).await?;
        debug!("Checkpoint table cdc_offsets ready");
        Ok(())
    }

    async fn load(&self, table: &str, default: Lsn) -> Result<Lsn> {
        let row = self
            .db
            .client()
            .await?
            .query_opt(
                "SELECT last_lsn FROM cdc_offsets WHERE table_name = $1",
                &[&table],
            )
            .await?;

        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.try_get(0)?;
                let lsn = Lsn::from_slice(&bytes)?;
                info!(table = %table, lsn = %lsn, "Loaded checkpoint");
                Ok(lsn)
            }
            None => {
                info!(table = %table, lsn = %default, "No checkpoint found, using default");
                Ok(default)
            }
        }
    }

    async fn save(&self, table: &str, lsn: Lsn) -> Result<()> {
        let bytes = lsn.as_bytes();
        self.db.client().await?.execute(UPSERT_OFFSET, &[&table, &bytes]).await?;
        debug!(table = %table, lsn = %lsn, "Checkpoint saved");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    lsn: Lsn,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileDocument {
    tables: BTreeMap<String, FileEntry>,
}

/// Checkpoints in a local JSON file.
///
/// The whole document is rewritten on each save by writing a temporary file,
/// syncing it, and renaming it over the original, so the file is never
/// observed half-written.
pub struct FileCheckpointStore {
    file_path: PathBuf,
    document: Mutex<Option<FileDocument>>,
}

impl FileCheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            file_path: path.as_ref().to_path_buf(),
            document: Mutex::new(None),
        }
    }

    async fn read_document(&self) -> Result<FileDocument> {
        if !self.file_path.exists() {
            debug!("No checkpoint file found at {:?}", self.file_path);
            return Ok(FileDocument::default());
        }

        let content = fs::read_to_string(&self.file_path).await?;
        serde_json::from_str(&content).map_err(|e| {
            error!("Failed to parse checkpoint file: {}", e);
            Error::Config(format!(
                "invalid checkpoint file {:?}: {}",
                self.file_path, e
            ))
        })
    }

    async fn write_document(&self, document: &FileDocument) -> Result<()> {
        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(document)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn initialize(&self) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut guard = self.document.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_document().await?);
        }
        Ok(())
    }

    async fn load(&self, table: &str, default: Lsn) -> Result<Lsn> {
        let mut guard = self.document.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_document().await?);
        }
        let lsn = guard
            .as_ref()
            .and_then(|doc| doc.tables.get(table))
            .map(|entry| entry.lsn)
            .unwrap_or(default);
        info!(table = %table, lsn = %lsn, "Loaded checkpoint");
        Ok(lsn)
    }

    async fn save(&self, table: &str, lsn: Lsn) -> Result<()> {
        let mut guard = self.document.lock().await;
        if guard.is_none() {
            *guard = Some(self.read_document().await?);
        }
        let Some(document) = guard.as_mut() else {
            return Ok(());
        };

        if let Some(existing) = document.tables.get(table) {
            if existing.lsn > lsn {
                debug!(table = %table, stored = %existing.lsn, lsn = %lsn, "Ignoring backwards checkpoint");
                return Ok(());
            }
        }

        let previous = document.tables.insert(
            table.to_string(),
            FileEntry {
                lsn,
                updated_at: Utc::now(),
            },
        );
        if let Err(e) = self.write_document(document).await {
            // Keep memory consistent with disk.
            match previous {
                Some(entry) => document.tables.insert(table.to_string(), entry),
                None => document.tables.remove(table),
            };
            return Err(e);
        }
        debug!(table = %table, lsn = %lsn, "Checkpoint saved");
        Ok(())
    }
}

/// In-process checkpoints with failure injection for tests.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<MemoryCheckpointState>,
}

#[derive(Default)]
struct MemoryCheckpointState {
    offsets: parking_lot::Mutex<HashMap<String, Lsn>>,
    history: parking_lot::Mutex<Vec<(String, Lsn)>>,
    failures: AtomicU32,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` saves fail with a connection error.
    pub fn fail_next_saves(&self, count: u32) {
        self.inner.failures.store(count, Ordering::SeqCst);
    }

    pub fn get(&self, table: &str) -> Option<Lsn> {
        self.inner.offsets.lock().get(table).copied()
    }

    /// Every successful save for `table`, in order.
    pub fn saves(&self, table: &str) -> Vec<Lsn> {
        self.inner
            .history
            .lock()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, lsn)| *lsn)
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn load(&self, table: &str, default: Lsn) -> Result<Lsn> {
        Ok(self.get(table).unwrap_or(default))
    }

    async fn save(&self, table: &str, lsn: Lsn) -> Result<()> {
        let injected = self
            .inner
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Connection("injected checkpoint failure".into()));
        }

        let mut offsets = self.inner.offsets.lock();
        let entry = offsets.entry(table.to_string()).or_insert(Lsn::ZERO);
        if lsn >= *entry {
            *entry = lsn;
        }
        self.inner.history.lock().push((table.to_string(), lsn));
        Ok(())
    }
}
