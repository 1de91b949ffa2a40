//! Error types and result handling for dstream.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate. Errors are classified by
//! how callers react to them: transient errors are retried inside the loop
//! that hit them, monitor-fatal errors stop one table monitor, and every
//! error maps to a process exit code.
//!
//! # Example
//!
//! ```rust
//! use dstream::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(e) if e.is_transient() => eprintln!("Will retry: {}", e),
//!     Err(e) => eprintln!("Fatal: {}", e),
//! }
//! ```

use thiserror::Error;

/// Exit code for a successful run.
pub const EXIT_OK: u8 = 0;
/// Exit code for configuration and resource errors.
pub const EXIT_CONFIG: u8 = 1;
/// Exit code for a provider (plugin) failure.
pub const EXIT_PROVIDER: u8 = 2;
/// Exit code when the process was interrupted by a signal.
pub const EXIT_INTERRUPTED: u8 = 130;

/// The main error type for dstream operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, detected before any work begins.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file or environment could not be loaded.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// PostgreSQL client error (source, checkpoint store or lease table).
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Kafka client, producer or consumer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding or decoding messages.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from files, pipes or child processes.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with the database or the bus.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// An LSN could not be decoded.
    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    /// The change table no longer matches what the monitor discovered.
    #[error("Schema drift on {table}: {message}")]
    SchemaDrift {
        /// Table whose shape changed
        table: String,
        /// What did not match
        message: String,
    },

    /// Lock primitive failure (not contention, which is not an error).
    #[error("Lock error: {0}")]
    Lock(String),

    /// The lease for a lock was lost to another holder or expired.
    #[error("Lease lost for {0}")]
    LeaseLost(String),

    /// The publisher could not get a batch accepted by the transport.
    #[error("Publish error: {0}")]
    Publish(String),

    /// A loop gave up after too many consecutive transient failures.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Number of consecutive failures observed
        attempts: u32,
        /// Message of the last failure
        last: String,
    },

    /// Every candidate table is locked elsewhere or failed to start.
    #[error("Nothing to monitor: {0}")]
    NothingToMonitor(String),

    /// A provider process failed or exited non-zero.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Malformed frame on a provider or plugin channel.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Graceful shutdown was requested (e.g., via Ctrl+C or SIGTERM).
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit loops that are blocked on I/O.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Builds a [`Error::SchemaDrift`] for `table`.
    pub fn schema_drift(table: impl Into<String>, message: impl Into<String>) -> Self {
        Error::SchemaDrift {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Builds a [`Error::Timeout`].
    pub fn timeout(message: impl Into<String>) -> Self {
        Error::Timeout {
            message: message.into(),
        }
    }

    /// Whether the failing operation may succeed if simply retried.
    ///
    /// Database errors carrying a SQLSTATE are classified by class: connection
    /// exceptions (`08`), insufficient resources (`53`), operator intervention
    /// (`57`) and serialization/deadlock failures (`40`) are transient. Errors
    /// without a SQLSTATE come from the socket and are transient too.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Postgres(e) => match e.code() {
                None => true,
                Some(code) => {
                    let class = &code.code()[..2];
                    matches!(class, "08" | "40" | "53" | "57")
                }
            },
            Error::Kafka(_)
            | Error::Connection(_)
            | Error::Lock(_)
            | Error::Publish(_)
            | Error::Io(_)
            | Error::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Whether the error ends a table monitor rather than being retried.
    pub fn is_fatal_for_monitor(&self) -> bool {
        !self.is_transient()
    }

    /// Process exit code for this error when it reaches `main`.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Shutdown => EXIT_INTERRUPTED,
            Error::Provider(_) | Error::Protocol(_) => EXIT_PROVIDER,
            _ => EXIT_CONFIG,
        }
    }
}

/// A convenient Result type alias for dstream operations.
///
/// This is equivalent to `std::result::Result<T, dstream::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
