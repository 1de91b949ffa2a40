pub mod cdc;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod ingester;
pub mod locking;
pub mod logging;
pub mod publisher;
pub mod router;

pub use config::Config;
pub use error::{Error, Result};
pub use executor::Executor;
pub use ingester::Ingester;
pub use router::Router;
