use crate::{Error, Result};
use std::net::IpAddr;
use tokio_postgres::config::Host;

/// Derives `<server>.<database>.<table>.events` destination names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNamer {
    server: String,
    database: String,
}

impl TopicNamer {
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server: server.into().to_lowercase(),
            database: database.into().to_lowercase(),
        }
    }

    /// Reads host and database from a source connection string.
    ///
    /// The server part is the first DNS label of the host. Local hosts
    /// (`localhost`, IP literals, unix sockets) are replaced by this
    /// machine's hostname so topics from different developer boxes do not
    /// collide.
    pub fn from_connection_string(connection_string: &str) -> Result<Self> {
        let config = connection_string
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::Config(format!("invalid connection string: {}", e)))?;

        let database = config
            .get_dbname()
            .ok_or_else(|| Error::Config("database name not found in connection string".into()))?;

        let host = match config.get_hosts().first() {
            Some(Host::Tcp(host)) => host.clone(),
            _ => "localhost".to_string(),
        };

        Ok(Self::new(server_name(&host)?, database))
    }

    pub fn topic(&self, table: &str) -> String {
        format!("{}.{}.{}.events", self.server, self.database, table.to_lowercase())
    }
}

fn server_name(host: &str) -> Result<String> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") || host.parse::<IpAddr>().is_ok() {
        return local_hostname();
    }
    let label = host.split('.').next().unwrap_or(host);
    if label.is_empty() {
        return Err(Error::Config("server name not found in connection string".into()));
    }
    Ok(label.to_lowercase())
}

/// This machine's hostname, lower-cased.
pub fn local_hostname() -> Result<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| Error::Config(format!("failed to get hostname: {}", e)))?;
    Ok(name.to_string_lossy().to_lowercase())
}
