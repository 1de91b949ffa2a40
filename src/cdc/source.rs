use super::types::{quote_ident, ChangeRow, TableDescriptor};
use super::Lsn;
use crate::db::Database;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::trace;

/// Read access to a table's change log.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// User columns of the change table, in ordinal order.
    async fn columns(&self, table: &TableDescriptor) -> Result<Vec<String>>;

    /// Up to `limit` rows with LSN strictly greater than `after`, ordered
    /// by `(lsn, seqval)`.
    async fn fetch_changes(
        &self,
        table: &TableDescriptor,
        columns: &[String],
        after: Lsn,
        limit: usize,
    ) -> Result<Vec<ChangeRow>>;

    /// Every row committed at exactly `lsn`, ordered by `seqval`.
    async fn fetch_lsn_group(
        &self,
        table: &TableDescriptor,
        columns: &[String],
        lsn: Lsn,
    ) -> Result<Vec<ChangeRow>>;

    /// The newest `limit` rows, used to estimate encoded row size.
    async fn sample(
        &self,
        table: &TableDescriptor,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<ChangeRow>>;
}

/// Change tables laid out as `<capture_schema>.<schema>_<table>_CT` with
/// `__$start_lsn`, `__$seqval` and `__$operation` ahead of the user columns.
///
/// Rows are selected by the column list discovered at start, so every poll
/// and sample first re-reads the catalog and fails with
/// [`Error::SchemaDrift`] when a column was added, dropped or reordered.
pub struct PgChangeSource {
    db: Database,
}

impl PgChangeSource {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn check_columns(&self, table: &TableDescriptor, expected: &[String]) -> Result<()> {
        let current = self.columns(table).await?;
        if current != expected {
            return Err(Error::schema_drift(
                &table.name,
                format!("columns changed from {:?} to {:?}", expected, current),
            ));
        }
        Ok(())
    }

    fn select_list(columns: &[String]) -> String {
        let mut list = String::from("\"__$start_lsn\", \"__$seqval\", \"__$operation\"");
        for column in columns {
            list.push_str(", ");
            list.push_str(&quote_ident(column));
            list.push_str("::text");
        }
        list
    }

    fn decode(table: &TableDescriptor, columns: &[String], row: &Row) -> Result<ChangeRow> {
        if row.len() != columns.len() + 3 {
            return Err(Error::schema_drift(
                &table.name,
                format!("expected {} columns, got {}", columns.len() + 3, row.len()),
            ));
        }
        let lsn: Vec<u8> = row.try_get(0)?;
        let seqval: Vec<u8> = row.try_get(1)?;
        let operation: i32 = row.try_get(2)?;
        let values = (0..columns.len())
            .map(|i| row.try_get::<_, Option<String>>(i + 3))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ChangeRow {
            lsn: Lsn::from_slice(&lsn)?,
            seqval,
            operation,
            values,
        })
    }

    /// Undefined tables or columns mean the change table was altered or dropped.
    fn map_query_error(table: &TableDescriptor, e: tokio_postgres::Error) -> Error {
        match e.code() {
            Some(code) if *code == SqlState::UNDEFINED_COLUMN || *code == SqlState::UNDEFINED_TABLE => {
                Error::schema_drift(&table.name, e.to_string())
            }
            _ => Error::Postgres(e),
        }
    }

    async fn query_rows(
        &self,
        table: &TableDescriptor,
        columns: &[String],
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<ChangeRow>> {
        let rows = self
            .db
            .client()
            .await?
            .query(sql, params)
            .await
            .map_err(|e| Self::map_query_error(table, e))?;
        rows.iter()
            .map(|row| Self::decode(table, columns, row))
            .collect()
    }
}

#[async_trait]
impl ChangeSource for PgChangeSource {
    async fn columns(&self, table: &TableDescriptor) -> Result<Vec<String>> {
        let rows = self
            .db
            .client()
            .await?
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 AND left(column_name, 3) <> '__$' \
                 ORDER BY ordinal_position",
                &[&table.capture_schema, &table.change_table()],
            )
            .await?;

        if rows.is_empty() {
            return Err(Error::schema_drift(
                &table.name,
                format!(
                    "change table {} not found or has no columns",
                    table.qualified_change_table()
                ),
            ));
        }

        let columns = rows
            .iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        trace!(table = %table.name, columns = ?columns, "Read columns");
        Ok(columns)
    }

    async fn fetch_changes(
        &self,
        table: &TableDescriptor,
        columns: &[String],
        after: Lsn,
        limit: usize,
    ) -> Result<Vec<ChangeRow>> {
        self.check_columns(table, columns).await?;
        let sql = format!(
            "SELECT {} FROM {} WHERE \"__$start_lsn\" > $1 \
             ORDER BY \"__$start_lsn\", \"__$seqval\" LIMIT $2",
            Self::select_list(columns),
            table.qualified_change_table()
        );
        let after = after.as_bytes();
        let limit = limit as i64;
        self.query_rows(table, columns, &sql, &[&after, &limit]).await
    }

    async fn fetch_lsn_group(
        &self,
        table: &TableDescriptor,
        columns: &[String],
        lsn: Lsn,
    ) -> Result<Vec<ChangeRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE \"__$start_lsn\" = $1 ORDER BY \"__$seqval\"",
            Self::select_list(columns),
            table.qualified_change_table()
        );
        let lsn = lsn.as_bytes();
        self.query_rows(table, columns, &sql, &[&lsn]).await
    }

    async fn sample(
        &self,
        table: &TableDescriptor,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<ChangeRow>> {
        self.check_columns(table, columns).await?;
        let sql = format!(
            "SELECT {} FROM {} ORDER BY \"__$start_lsn\" DESC, \"__$seqval\" DESC LIMIT $1",
            Self::select_list(columns),
            table.qualified_change_table()
        );
        let limit = limit as i64;
        self.query_rows(table, columns, &sql, &[&limit]).await
    }
}

#[derive(Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<ChangeRow>,
}

/// In-memory change log for tests.
#[derive(Clone, Default)]
pub struct MemoryChangeSource {
    tables: Arc<parking_lot::Mutex<HashMap<String, MemoryTable>>>,
    failures: Arc<AtomicU32>,
    fetches: Arc<AtomicU32>,
}

impl MemoryChangeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, name: &str, columns: &[&str]) {
        self.tables.lock().insert(
            name.to_string(),
            MemoryTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Replaces the column list, as an `ALTER TABLE` at the source would.
    pub fn set_columns(&self, name: &str, columns: &[&str]) {
        if let Some(table) = self.tables.lock().get_mut(name) {
            table.columns = columns.iter().map(|c| c.to_string()).collect();
        }
    }

    pub fn push(&self, name: &str, row: ChangeRow) {
        if let Some(table) = self.tables.lock().get_mut(name) {
            table.rows.push(row);
        }
    }

    /// Makes the next `count` fetches fail with a connection error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn sorted_rows(&self, table: &TableDescriptor) -> Result<Vec<ChangeRow>> {
        let tables = self.tables.lock();
        let Some(memory) = tables.get(&table.name) else {
            return Err(Error::schema_drift(&table.name, "change table not found"));
        };
        let mut rows = memory.rows.clone();
        rows.sort_by(|a, b| (a.lsn, &a.seqval).cmp(&(b.lsn, &b.seqval)));
        Ok(rows)
    }

    fn check_columns(&self, table: &TableDescriptor, columns: &[String]) -> Result<()> {
        let tables = self.tables.lock();
        match tables.get(&table.name) {
            Some(memory) if memory.columns == columns => Ok(()),
            Some(_) => Err(Error::schema_drift(&table.name, "column list changed")),
            None => Err(Error::schema_drift(&table.name, "change table not found")),
        }
    }

    fn take_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Connection("injected source failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn columns(&self, table: &TableDescriptor) -> Result<Vec<String>> {
        self.tables
            .lock()
            .get(&table.name)
            .map(|t| t.columns.clone())
            .ok_or_else(|| Error::schema_drift(&table.name, "change table not found"))
    }

    async fn fetch_changes(
        &self,
        table: &TableDescriptor,
        columns: &[String],
        after: Lsn,
        limit: usize,
    ) -> Result<Vec<ChangeRow>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        self.check_columns(table, columns)?;
        Ok(self
            .sorted_rows(table)?
            .into_iter()
            .filter(|row| row.lsn > after)
            .take(limit)
            .collect())
    }

    async fn fetch_lsn_group(
        &self,
        table: &TableDescriptor,
        columns: &[String],
        lsn: Lsn,
    ) -> Result<Vec<ChangeRow>> {
        self.take_failure()?;
        self.check_columns(table, columns)?;
        Ok(self
            .sorted_rows(table)?
            .into_iter()
            .filter(|row| row.lsn == lsn)
            .collect())
    }

    async fn sample(
        &self,
        table: &TableDescriptor,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<ChangeRow>> {
        self.check_columns(table, columns)?;
        let mut rows = self.sorted_rows(table)?;
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }
}
