use super::{LeaseTiming, Lease, Locker, BREAK_PAUSE};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

struct Held {
    lease_id: String,
    holder: String,
    renewed_at: Instant,
    renewals: u32,
}

#[derive(Default)]
struct Shared {
    leases: Mutex<HashMap<String, Held>>,
    renewal_failures: AtomicU32,
}

/// Process-local locker. Handles made with [`MemoryLocker::peer`] share
/// lease state but act as different holders, which is how tests model
/// several workers.
///
/// Ages are measured on tokio's clock, so paused-time tests can age leases.
pub struct MemoryLocker {
    shared: Arc<Shared>,
    holder: String,
    timing: LeaseTiming,
}

impl MemoryLocker {
    pub fn new(timing: LeaseTiming) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            holder: Uuid::new_v4().to_string(),
            timing,
        }
    }

    /// Another worker's view of the same lock space.
    pub fn peer(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            holder: Uuid::new_v4().to_string(),
            timing: self.timing,
        }
    }

    pub fn fail_next_renewals(&self, count: u32) {
        self.shared.renewal_failures.store(count, Ordering::SeqCst);
    }

    pub fn renewals(&self, lock_name: &str) -> u32 {
        self.shared
            .leases
            .lock()
            .get(lock_name)
            .map(|h| h.renewals)
            .unwrap_or(0)
    }

    pub fn is_held(&self, lock_name: &str) -> bool {
        self.shared.leases.lock().contains_key(lock_name)
    }

    /// Whether this handle holds `lock_name`.
    pub fn holds(&self, lock_name: &str) -> bool {
        self.shared
            .leases
            .lock()
            .get(lock_name)
            .is_some_and(|h| h.holder == self.holder)
    }

    fn try_insert(&self, lock_name: &str) -> Option<Lease> {
        let mut leases = self.shared.leases.lock();
        if leases.contains_key(lock_name) {
            return None;
        }
        let lease_id = Uuid::new_v4().to_string();
        leases.insert(
            lock_name.to_string(),
            Held {
                lease_id: lease_id.clone(),
                holder: self.holder.clone(),
                renewed_at: Instant::now(),
                renewals: 0,
            },
        );
        Some(Lease {
            lock_name: lock_name.to_string(),
            lease_id,
            acquired_at: Utc::now(),
            ttl: self.timing.ttl,
        })
    }

    /// Removes the current lease if it is stale; returns whether it did.
    fn break_if_stale(&self, lock_name: &str) -> bool {
        let mut leases = self.shared.leases.lock();
        let stale = leases
            .get(lock_name)
            .is_some_and(|h| self.timing.is_stale(h.renewed_at.elapsed()));
        if stale {
            if let Some(old) = leases.remove(lock_name) {
                warn!(lock_name = %lock_name, holder = %old.holder, "Broke stale lease");
            }
        }
        stale
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    fn timing(&self) -> LeaseTiming {
        self.timing
    }

    async fn acquire(&self, lock_name: &str) -> Result<Option<Lease>> {
        if let Some(lease) = self.try_insert(lock_name) {
            info!(lock_name = %lock_name, "Lease acquired");
            return Ok(Some(lease));
        }
        if !self.break_if_stale(lock_name) {
            return Ok(None);
        }
        tokio::time::sleep(BREAK_PAUSE).await;
        let lease = self.try_insert(lock_name);
        if lease.is_some() {
            info!(lock_name = %lock_name, "Lease acquired after breaking stale holder");
        }
        Ok(lease)
    }

    async fn renew(&self, lock_name: &str, lease_id: &str) -> Result<()> {
        let injected = self
            .shared
            .renewal_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Lock(format!("injected renewal failure for {}", lock_name)));
        }

        let mut leases = self.shared.leases.lock();
        match leases.get_mut(lock_name) {
            Some(held) if held.lease_id == lease_id => {
                held.renewed_at = Instant::now();
                held.renewals += 1;
                Ok(())
            }
            _ => Err(Error::LeaseLost(lock_name.to_string())),
        }
    }

    async fn release(&self, lock_name: &str, lease_id: &str) -> Result<()> {
        let mut leases = self.shared.leases.lock();
        if leases.get(lock_name).is_some_and(|h| h.lease_id == lease_id) {
            leases.remove(lock_name);
            info!(lock_name = %lock_name, "Lease released");
        }
        Ok(())
    }

    async fn inspect(&self, tables: &[String]) -> Result<HashSet<String>> {
        let leases = self.shared.leases.lock();
        Ok(tables
            .iter()
            .filter(|table| {
                leases
                    .get(&super::lock_name(table))
                    .is_some_and(|h| !self.timing.is_stale(h.renewed_at.elapsed()))
            })
            .cloned()
            .collect())
    }
}
