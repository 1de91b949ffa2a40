//! Brings up one [`TableMonitor`] per table this worker may own.
//!
//! Tables already locked by another worker are skipped up front; the rest
//! are claimed one by one, each under its own lease with a background
//! renewer, and started with a short stagger so a warm restart does not hit
//! the source with every table at once. A monitor that fails does not stop
//! its peers; its lease is released and the failure recorded. A monitor
//! whose lease was lost is not released, since another worker may own it.

use super::checkpoint::CheckpointStore;
use super::monitor::{MonitorSettings, TableMonitor};
use super::source::ChangeSource;
use super::types::TableDescriptor;
use crate::locking::{self, Lease, Locker, RenewalOutcome};
use crate::publisher::{ChangePublisher, TopicNamer};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
}

/// Everything needed to build a monitor for any configured table.
pub struct MonitorFactory {
    pub source: Arc<dyn ChangeSource>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub publisher: Arc<dyn ChangePublisher>,
    pub namer: TopicNamer,
    pub schema: String,
    pub capture_schema: String,
    pub settings: MonitorSettings,
}

impl MonitorFactory {
    pub fn descriptor(&self, spec: &TableSpec) -> TableDescriptor {
        TableDescriptor {
            name: spec.name.clone(),
            schema: self.schema.clone(),
            capture_schema: self.capture_schema.clone(),
            poll_interval: spec.poll_interval,
            max_poll_interval: spec.max_poll_interval,
            destination: self.namer.topic(&spec.name),
        }
    }

    pub async fn build(&self, spec: &TableSpec) -> Result<TableMonitor> {
        TableMonitor::start(
            self.descriptor(spec),
            Arc::clone(&self.source),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.publisher),
            self.settings.clone(),
        )
        .await
    }
}

/// What happened to each candidate table during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorReport {
    pub started: Vec<String>,
    /// Locked by another worker.
    pub skipped: Vec<String>,
    /// Could not start, or stopped with an error.
    pub failed: Vec<String>,
    /// Stopped because the lease could not be renewed.
    pub lost: Vec<String>,
}

struct HeldTable {
    lease: Lease,
    cancel: CancellationToken,
    renewer: JoinHandle<RenewalOutcome>,
}

pub struct Orchestrator {
    locker: Arc<dyn Locker>,
    factory: Arc<MonitorFactory>,
    tables: Vec<TableSpec>,
    stagger: Duration,
}

impl Orchestrator {
    pub fn new(
        locker: Arc<dyn Locker>,
        factory: Arc<MonitorFactory>,
        tables: Vec<TableSpec>,
        stagger: Duration,
    ) -> Self {
        Self {
            locker,
            factory,
            tables,
            stagger,
        }
    }

    /// Runs monitors until all have stopped. Cancelling `cancel` stops them
    /// at their next poll boundary and releases their leases.
    pub async fn run(&self, cancel: CancellationToken) -> Result<OrchestratorReport> {
        let mut report = OrchestratorReport::default();

        let names: Vec<String> = self.tables.iter().map(|t| t.name.clone()).collect();
        let locked = self.locker.inspect(&names).await?;
        let candidates: Vec<&TableSpec> = self
            .tables
            .iter()
            .filter(|t| {
                if locked.contains(&t.name) {
                    info!(table = %t.name, "Table already monitored by another worker");
                    report.skipped.push(t.name.clone());
                    false
                } else {
                    true
                }
            })
            .collect();

        if candidates.is_empty() {
            warn!("Every configured table is locked by another worker");
            return Err(Error::NothingToMonitor(
                "all configured tables are locked elsewhere".into(),
            ));
        }

        let mut held: HashMap<String, HeldTable> = HashMap::new();
        let mut tasks: HashMap<Id, String> = HashMap::new();
        let mut monitors = JoinSet::new();

        for (i, spec) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 && !self.stagger.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.stagger) => {}
                }
            }

            let lock = locking::lock_name(&spec.name);
            let lease = match self.locker.acquire(&lock).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    info!(table = %spec.name, "Table already monitored by another worker");
                    report.skipped.push(spec.name.clone());
                    continue;
                }
                Err(e) => {
                    warn!(table = %spec.name, error = %e, "Could not acquire lease");
                    report.failed.push(spec.name.clone());
                    continue;
                }
            };

            let table_cancel = cancel.child_token();
            let renewer = locking::start_renewal(
                Arc::clone(&self.locker),
                lease.clone(),
                table_cancel.clone(),
            );

            let monitor = match self.factory.build(spec).await {
                Ok(monitor) => monitor,
                Err(e) => {
                    error!(table = %spec.name, error = %e, "Failed to start monitor");
                    table_cancel.cancel();
                    let _ = renewer.await;
                    self.release(&lease).await;
                    report.failed.push(spec.name.clone());
                    continue;
                }
            };

            let token = table_cancel.clone();
            let task = monitors.spawn(async move { monitor.run(token).await });
            tasks.insert(task.id(), spec.name.clone());

            held.insert(
                spec.name.clone(),
                HeldTable {
                    lease,
                    cancel: table_cancel,
                    renewer,
                },
            );
            info!(table = %spec.name, "Monitor started");
            report.started.push(spec.name.clone());
        }

        if monitors.is_empty() {
            return Err(Error::NothingToMonitor(
                "no table could be claimed and started".into(),
            ));
        }

        while let Some(joined) = monitors.join_next_with_id().await {
            // A panicked monitor is a failed one: its lease goes back like any other.
            let (id, result) = match joined {
                Ok((id, result)) => (id, result.map_err(|e| e.to_string())),
                Err(e) => (e.id(), Err(format!("monitor task panicked: {}", e))),
            };
            let Some(name) = tasks.remove(&id) else {
                continue;
            };
            let Some(table) = held.remove(&name) else {
                continue;
            };

            table.cancel.cancel();
            let outcome = table.renewer.await.unwrap_or(RenewalOutcome::Stopped);

            match (&result, outcome) {
                (_, RenewalOutcome::Lost) => {
                    warn!(table = %name, "Monitor stopped after losing its lease");
                    report.lost.push(name);
                    continue;
                }
                (Ok(()), _) => info!(table = %name, "Monitor finished"),
                (Err(e), _) => {
                    error!(table = %name, error = %e, "Monitor failed");
                    report.failed.push(name);
                }
            }
            self.release(&table.lease).await;
        }

        Ok(report)
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.locker.release(&lease.lock_name, &lease.lease_id).await {
            warn!(lock_name = %lease.lock_name, error = %e, "Failed to release lease");
        }
    }
}
