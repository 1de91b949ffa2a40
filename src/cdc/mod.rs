pub mod backoff;
pub mod batch_sizer;
pub mod checkpoint;
pub mod lsn;
pub mod monitor;
pub mod orchestrator;
pub mod source;
pub mod types;

pub use batch_sizer::{BatchSizer, BatchSizerMetrics, BatchSizerSettings, SinkLimit};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, PgCheckpointStore};
pub use lsn::Lsn;
pub use monitor::{MonitorSettings, PollOutcome, TableMonitor};
pub use orchestrator::{MonitorFactory, Orchestrator, OrchestratorReport, TableSpec};
pub use source::{ChangeSource, MemoryChangeSource, PgChangeSource};
pub use types::{ChangeEvent, ChangeRow, EventMetadata, Operation, TableDescriptor};
