//! Named, TTL-bounded exclusive leases shared by cooperating workers.
//!
//! Every monitored table is guarded by the lock `"<table>.lock"`. A holder
//! renews its lease every `ttl / 2`; a lease whose last renewal is older
//! than the stale threshold may be broken by another worker and reacquired.
//! A lease exactly as old as the threshold is still valid.

pub mod memory;
pub mod postgres;

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub use memory::MemoryLocker;
pub use postgres::PgLocker;

/// Minimum age before a lease may be broken.
pub const MIN_STALE_THRESHOLD: Duration = Duration::from_secs(120);

/// Consecutive renewal failures after which a lease is considered lost.
pub const MAX_RENEWAL_FAILURES: u32 = 2;

/// Pause between breaking a stale lease and reacquiring it.
pub const BREAK_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    pub ttl: Duration,
    pub stale_threshold: Duration,
}

impl LeaseTiming {
    pub fn new(ttl: Duration, stale_threshold: Duration) -> Self {
        Self {
            ttl,
            stale_threshold,
        }
    }

    /// Stale threshold defaults to twice the TTL, but never under two minutes.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::new(ttl, (ttl * 2).max(MIN_STALE_THRESHOLD))
    }

    pub fn renew_every(&self) -> Duration {
        self.ttl / 2
    }

    /// Breaking requires an age strictly greater than the threshold.
    pub fn is_stale(&self, age: Duration) -> bool {
        age > self.stale_threshold
    }
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub lock_name: String,
    pub lease_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

pub fn lock_name(table: &str) -> String {
    format!("{}.lock", table)
}

pub fn table_from_lock(lock: &str) -> &str {
    lock.strip_suffix(".lock").unwrap_or(lock)
}

/// Identity recorded with each lease, for operators inspecting the lock table.
pub fn holder_id() -> String {
    let host = crate::publisher::topic::local_hostname().unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

#[async_trait]
pub trait Locker: Send + Sync {
    fn timing(&self) -> LeaseTiming;

    /// Takes the lock, or returns `Ok(None)` when a live holder has it.
    ///
    /// A lease older than the stale threshold is broken and reacquired.
    async fn acquire(&self, lock_name: &str) -> Result<Option<Lease>>;

    /// Extends the lease by one TTL. Fails with [`Error::LeaseLost`] when
    /// `lease_id` no longer holds the lock.
    async fn renew(&self, lock_name: &str, lease_id: &str) -> Result<()>;

    /// Gives the lock up. Does nothing if `lease_id` is not the holder.
    async fn release(&self, lock_name: &str, lease_id: &str) -> Result<()>;

    /// The subset of `tables` whose locks have a live holder.
    async fn inspect(&self, tables: &[String]) -> Result<HashSet<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// Cancelled while the lease was still held.
    Stopped,
    /// Renewal failed; the renewer cancelled its token.
    Lost,
}

/// Renews `lease` every `ttl / 2` until `cancel` fires.
///
/// [`Error::LeaseLost`] ends renewal at once. Other errors are tolerated
/// until [`MAX_RENEWAL_FAILURES`] happen in a row. On loss the renewer
/// cancels `cancel` so the lease's owner stops. It never releases the lease.
pub fn start_renewal(
    locker: Arc<dyn Locker>,
    lease: Lease,
    cancel: CancellationToken,
) -> JoinHandle<RenewalOutcome> {
    tokio::spawn(async move {
        let period = locker.timing().renew_every();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return RenewalOutcome::Stopped,
                _ = tokio::time::sleep(period) => {}
            }

            match locker.renew(&lease.lock_name, &lease.lease_id).await {
                Ok(()) => {
                    failures = 0;
                    debug!(lock_name = %lease.lock_name, "Lease renewed");
                }
                Err(Error::LeaseLost(name)) => {
                    error!(lock_name = %name, "Lease lost to another holder");
                    cancel.cancel();
                    return RenewalOutcome::Lost;
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        lock_name = %lease.lock_name,
                        failures,
                        error = %e,
                        "Lease renewal failed"
                    );
                    if failures >= MAX_RENEWAL_FAILURES {
                        error!(lock_name = %lease.lock_name, "Giving up lease after repeated renewal failures");
                        cancel.cancel();
                        return RenewalOutcome::Lost;
                    }
                }
            }
        }
    })
}
