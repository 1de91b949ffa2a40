use super::{holder_id, table_from_lock, LeaseTiming, Lease, Locker, BREAK_PAUSE};
use crate::cdc::types::quote_ident;
use crate::db::Database;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Leases stored as rows of a lock table; ages use the database clock so
/// workers with skewed clocks agree on staleness.
pub struct PgLocker {
    db: Database,
    table: String,
    holder: String,
    timing: LeaseTiming,
}

impl PgLocker {
    pub fn new(db: Database, table: &str, timing: LeaseTiming) -> Self {
        Self {
            db,
            table: quote_ident(table),
            holder: holder_id(),
            timing,
        }
    }

    /// Creates the lock table if it does not exist.
    pub async fn initialize(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                lock_name TEXT PRIMARY KEY,
                lease_id TEXT NOT NULL,
                holder TEXT NOT NULL,
                acquired_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                renewed_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            self.table
        );
        self.db.client().await?.batch_execute(&ddl).await?;
        Ok(())
    }

    async fn try_insert(&self, lock_name: &str) -> Result<Option<Lease>> {
        let lease_id = Uuid::new_v4().to_string();
        let sql = format!(
            "INSERT INTO {} (lock_name, lease_id, holder, acquired_at, renewed_at) \
             VALUES ($1, $2, $3, now(), now()) \
             ON CONFLICT (lock_name) DO NOTHING RETURNING acquired_at",
            self.table
        );
        let row = self
            .db
            .client()
            .await?
            .query_opt(&sql, &[&lock_name, &lease_id, &self.holder])
            .await?;

        match row {
            Some(row) => {
                let acquired_at: DateTime<Utc> = row.try_get(0)?;
                Ok(Some(Lease {
                    lock_name: lock_name.to_string(),
                    lease_id,
                    acquired_at,
                    ttl: self.timing.ttl,
                }))
            }
            None => Ok(None),
        }
    }

    /// Current holder's lease id, holder, and seconds since last renewal.
    async fn current(&self, lock_name: &str) -> Result<Option<(String, String, f64)>> {
        let sql = format!(
            "SELECT lease_id, holder, EXTRACT(EPOCH FROM (now() - renewed_at))::float8 \
             FROM {} WHERE lock_name = $1",
            self.table
        );
        let row = self.db.client().await?.query_opt(&sql, &[&lock_name]).await?;
        row.map(|row| -> Result<(String, String, f64)> {
            Ok((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?))
        })
        .transpose()
    }

    /// Deletes the lease only if `lease_id` still holds it.
    async fn break_lease(&self, lock_name: &str, lease_id: &str) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE lock_name = $1 AND lease_id = $2",
            self.table
        );
        Ok(self.db.client().await?.execute(&sql, &[&lock_name, &lease_id]).await? > 0)
    }
}

#[async_trait]
impl Locker for PgLocker {
    fn timing(&self) -> LeaseTiming {
        self.timing
    }

    async fn acquire(&self, lock_name: &str) -> Result<Option<Lease>> {
        if let Some(lease) = self.try_insert(lock_name).await? {
            info!(lock_name = %lock_name, "Lease acquired");
            return Ok(Some(lease));
        }

        let Some((lease_id, holder, age_secs)) = self.current(lock_name).await? else {
            // Released between our insert and select.
            return self.try_insert(lock_name).await;
        };

        let age = Duration::from_secs_f64(age_secs.max(0.0));
        if !self.timing.is_stale(age) {
            debug!(lock_name = %lock_name, holder = %holder, age_secs, "Lease is held");
            return Ok(None);
        }

        if self.break_lease(lock_name, &lease_id).await? {
            warn!(lock_name = %lock_name, holder = %holder, age_secs, "Broke stale lease");
        }
        tokio::time::sleep(BREAK_PAUSE).await;

        let lease = self.try_insert(lock_name).await?;
        if lease.is_some() {
            info!(lock_name = %lock_name, "Lease acquired after breaking stale holder");
        }
        Ok(lease)
    }

    async fn renew(&self, lock_name: &str, lease_id: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET renewed_at = now() WHERE lock_name = $1 AND lease_id = $2",
            self.table
        );
        match self.db.client().await?.execute(&sql, &[&lock_name, &lease_id]).await? {
            0 => Err(Error::LeaseLost(lock_name.to_string())),
            _ => Ok(()),
        }
    }

    async fn release(&self, lock_name: &str, lease_id: &str) -> Result<()> {
        if self.break_lease(lock_name, lease_id).await? {
            info!(lock_name = %lock_name, "Lease released");
        }
        Ok(())
    }

    async fn inspect(&self, tables: &[String]) -> Result<HashSet<String>> {
        let names: Vec<String> = tables.iter().map(|t| super::lock_name(t)).collect();
        let sql = format!(
            "SELECT lock_name FROM {} WHERE lock_name = ANY($1) \
             AND EXTRACT(EPOCH FROM (now() - renewed_at))::float8 <= $2",
            self.table
        );
        let threshold = self.timing.stale_threshold.as_secs_f64();
        let rows = self.db.client().await?.query(&sql, &[&names, &threshold]).await?;

        rows.iter()
            .map(|row| -> Result<String> {
                let lock: String = row.try_get(0)?;
                Ok(table_from_lock(&lock).to_string())
            })
            .collect()
    }
}
