use crate::cdc::batch_sizer::SinkLimit;
use crate::locking::LeaseTiming;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for the publisher's flush interval.
pub const MAX_FLUSH_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub ingester: Option<IngesterConfig>,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngesterConfig {
    pub db_connection_string: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_capture_schema")]
    pub capture_schema: String,
    #[serde(default = "default_ingest_queue")]
    pub ingest_queue: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    #[serde(default)]
    pub poll_jitter: bool,
    /// Hex LSN used when a table has no checkpoint yet.
    #[serde(default)]
    pub start_lsn: Option<String>,
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default)]
    pub sink_limit: SinkLimit,
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
    #[serde(default = "default_resample_interval_secs")]
    pub resample_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_flush_interval_ms")]
    pub batch_flush_interval_ms: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableConfig {
    pub name: String,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockConfig {
    #[serde(flatten)]
    pub backend: LockBackend,
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub stale_threshold_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LockBackend {
    Postgres {
        /// Defaults to the ingester's source connection string.
        #[serde(default)]
        connection_string: Option<String>,
        #[serde(default = "default_lease_table")]
        table: String,
    },
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckpointConfig {
    #[default]
    Database,
    File {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PublisherConfig {
    Kafka(KafkaConfig),
    Console,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u32,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
    /// Extra librdkafka properties, e.g. SASL settings for Event Hubs.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_forwarders")]
    pub forwarders: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub input: Option<ProviderConfig>,
    #[serde(default)]
    pub output: Option<ProviderConfig>,
    #[serde(default)]
    pub plugin_path: Option<PathBuf>,
    #[serde(default)]
    pub plugin_ref: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Providers,
    Plugin,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub provider_path: Option<PathBuf>,
    #[serde(default)]
    pub provider_ref: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Config {
    /// Loads a TOML file layered with `DSTREAM_` environment overrides,
    /// then validates the result.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(true));
        Self::build(builder)
    }

    /// Same as [`Config::from_file`] but from an in-memory TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));
        Self::build(builder)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let settings = builder
            .add_source(
                config::Environment::with_prefix("DSTREAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that cannot run, before any work begins.
    pub fn validate(&self) -> Result<()> {
        if let Some(ingester) = &self.ingester {
            ingester.validate()?;
        }

        if let PublisherConfig::Kafka(kafka) = &self.publisher {
            if kafka.brokers.iter().all(|b| b.trim().is_empty()) {
                return Err(Error::Config("publisher.brokers must not be empty".into()));
            }
            if kafka.partitions < 1 || kafka.replication_factor < 1 {
                return Err(Error::Config(
                    "publisher.partitions and publisher.replication_factor must be positive".into(),
                ));
            }
        }

        if self.router.forwarders == 0 || self.router.max_in_flight == 0 {
            return Err(Error::Config(
                "router.forwarders and router.max_in_flight must be positive".into(),
            ));
        }
        if self.router.retry_max_ms < self.router.retry_initial_ms {
            return Err(Error::Config(
                "router.retry_max_ms must be >= router.retry_initial_ms".into(),
            ));
        }

        let mut names = HashSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                return Err(Error::Config(format!("duplicate task '{}'", task.name)));
            }
            task.validate()?;
        }

        Ok(())
    }

    /// The `[ingester]` section, required by the ingester and router roles.
    pub fn ingester(&self) -> Result<&IngesterConfig> {
        self.ingester
            .as_ref()
            .ok_or_else(|| Error::Config("missing [ingester] section".into()))
    }

    pub fn task(&self, name: &str) -> Result<&TaskConfig> {
        self.tasks
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::Config(format!("task '{}' not found", name)))
    }
}

impl IngesterConfig {
    fn validate(&self) -> Result<()> {
        if self.db_connection_string.trim().is_empty() {
            return Err(Error::Config("ingester.db_connection_string is required".into()));
        }
        if self.tables.is_empty() {
            return Err(Error::Config("ingester.tables must list at least one table".into()));
        }
        if self.ingest_queue.trim().is_empty() {
            return Err(Error::Config("ingester.ingest_queue must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(Error::Config("table name must not be empty".into()));
            }
            if !seen.insert(table.name.to_lowercase()) {
                return Err(Error::Config(format!("duplicate table '{}'", table.name)));
            }
            let (interval, max) = self.poll_intervals(table);
            if interval.is_zero() {
                return Err(Error::Config(format!(
                    "poll interval for '{}' must be positive",
                    table.name
                )));
            }
            if max < interval {
                return Err(Error::Config(format!(
                    "max poll interval for '{}' is shorter than its poll interval",
                    table.name
                )));
            }
        }

        if self.batch_size == 0 || self.buffer_capacity == 0 || self.sample_rows == 0 {
            return Err(Error::Config(
                "ingester.batch_size, buffer_capacity and sample_rows must be positive".into(),
            ));
        }
        if self.batch_flush_interval_ms == 0 || self.batch_flush_interval_ms > MAX_FLUSH_INTERVAL_MS {
            return Err(Error::Config(format!(
                "ingester.batch_flush_interval_ms must be within 1..={}",
                MAX_FLUSH_INTERVAL_MS
            )));
        }
        if self.publish_timeout_secs == 0 {
            return Err(Error::Config("ingester.publish_timeout_secs must be positive".into()));
        }
        if let Some(start) = &self.start_lsn {
            start.parse::<crate::cdc::Lsn>()?;
        }

        self.locks.validate()?;
        if let CheckpointConfig::File { path } = &self.checkpoint {
            if path.as_os_str().is_empty() {
                return Err(Error::Config("ingester.checkpoint.path must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Effective `(poll_interval, max_poll_interval)` for a table.
    pub fn poll_intervals(&self, table: &TableConfig) -> (Duration, Duration) {
        let interval = table.poll_interval_ms.unwrap_or(self.poll_interval_ms);
        let max = table.max_poll_interval_ms.unwrap_or(self.max_poll_interval_ms);
        (Duration::from_millis(interval), Duration::from_millis(max))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn resample_interval(&self) -> Duration {
        Duration::from_secs(self.resample_interval_secs)
    }

    /// Connection string for the lease table, falling back to the source.
    pub fn lock_connection_string(&self) -> Option<&str> {
        match &self.locks.backend {
            LockBackend::Postgres {
                connection_string, ..
            } => Some(
                connection_string
                    .as_deref()
                    .unwrap_or(&self.db_connection_string),
            ),
            LockBackend::Memory => None,
        }
    }
}

impl LockConfig {
    fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(Error::Config("ingester.locks.ttl_secs must be positive".into()));
        }
        if let Some(stale) = self.stale_threshold_secs {
            if stale < self.ttl_secs {
                return Err(Error::Config(
                    "ingester.locks.stale_threshold_secs must be >= ttl_secs".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn timing(&self) -> LeaseTiming {
        let ttl = Duration::from_secs(self.ttl_secs);
        match self.stale_threshold_secs {
            Some(secs) => LeaseTiming::new(ttl, Duration::from_secs(secs)),
            None => LeaseTiming::with_ttl(ttl),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::Postgres {
                connection_string: None,
                table: default_lease_table(),
            },
            ttl_secs: default_lease_ttl_secs(),
            stale_threshold_secs: None,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig::Console
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            forwarders: default_forwarders(),
            max_in_flight: default_max_in_flight(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl TaskConfig {
    fn validate(&self) -> Result<()> {
        match self.kind {
            TaskKind::Providers => {
                let input = self.input.as_ref().ok_or_else(|| {
                    Error::Config(format!("task '{}' is missing an input block", self.name))
                })?;
                let output = self.output.as_ref().ok_or_else(|| {
                    Error::Config(format!("task '{}' is missing an output block", self.name))
                })?;
                input.validate(&self.name, "input")?;
                output.validate(&self.name, "output")
            }
            TaskKind::Plugin => match (&self.plugin_path, &self.plugin_ref) {
                (Some(_), None) | (None, Some(_)) => Ok(()),
                _ => Err(Error::Config(format!(
                    "task '{}' needs exactly one of plugin_path or plugin_ref",
                    self.name
                ))),
            },
        }
    }
}

impl ProviderConfig {
    fn validate(&self, task: &str, role: &str) -> Result<()> {
        match (&self.provider_path, &self.provider_ref) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(Error::Config(format!(
                "task '{}' {} needs exactly one of provider_path or provider_ref",
                task, role
            ))),
        }
    }
}

fn default_schema() -> String {
    "dbo".to_string()
}

fn default_capture_schema() -> String {
    "cdc".to_string()
}

fn default_ingest_queue() -> String {
    "ingest-queue".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_max_poll_interval_ms() -> u64 {
    60_000
}

fn default_stagger_ms() -> u64 {
    500
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_sample_rows() -> usize {
    100
}

fn default_resample_interval_secs() -> u64 {
    3_600
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_flush_interval_ms() -> u64 {
    100
}

fn default_buffer_capacity() -> usize {
    1_000
}

fn default_publish_timeout_secs() -> u64 {
    10
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_lease_table() -> String {
    "dstream_leases".to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u32 {
    5
}

fn default_message_timeout_ms() -> u32 {
    10_000
}

fn default_partitions() -> i32 {
    3
}

fn default_replication_factor() -> i32 {
    1
}

fn default_group_id() -> String {
    "dstream-router".to_string()
}

fn default_forwarders() -> usize {
    4
}

fn default_max_in_flight() -> usize {
    1_000
}

fn default_retry_initial_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}
