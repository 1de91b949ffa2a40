use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{error, info, warn};

/// Shared PostgreSQL handle. The underlying client is replaced with a fresh
/// connection the next time it is asked for after its connection closed.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    client: Mutex<Arc<Client>>,
    reconnects: AtomicU64,
}

impl Database {
    /// A live client. Queries already running on a dropped connection still
    /// fail; the caller's retry gets the new one.
    pub async fn client(&self) -> Result<Arc<Client>> {
        let mut current = self.inner.client.lock().await;
        if current.is_closed() {
            warn!("PostgreSQL connection closed, reconnecting");
            *current = open(&self.inner.config).await?;
            self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Arc::clone(&*current))
    }

    /// Connections re-established since [`connect`].
    pub fn reconnects(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }
}

/// Opens a client connection and drives it on a background task.
pub async fn connect(connection_string: &str) -> Result<Database> {
    let config = connection_string
        .parse::<Config>()
        .map_err(|e| Error::Config(format!("invalid connection string: {}", e)))?;

    let client = open(&config).await?;
    info!(
        database = config.get_dbname().unwrap_or_default(),
        "Connected to PostgreSQL"
    );
    Ok(Database {
        inner: Arc::new(Inner {
            config,
            client: Mutex::new(client),
            reconnects: AtomicU64::new(0),
        }),
    })
}

async fn open(config: &Config) -> Result<Arc<Client>> {
    let (client, connection) = config.connect(NoTls).await.map_err(classify)?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Connection error: {}", e);
        }
    });

    Ok(Arc::new(client))
}

/// Separates credential failures, which are never retried.
fn classify(e: tokio_postgres::Error) -> Error {
    match e.code() {
        Some(code)
            if *code == SqlState::INVALID_PASSWORD
                || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION =>
        {
            Error::Authentication(e.to_string())
        }
        _ => Error::Postgres(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_url() -> String {
        std::env::var("TEST_PG_URL")
            .unwrap_or_else(|_| "host=localhost user=postgres password=postgres".to_string())
    }

    #[tokio::test]
    async fn test_invalid_connection_string_is_config_error() {
        assert!(matches!(
            connect("host=localhost port=notaport").await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_reconnects_after_backend_is_terminated() {
        let db = connect(&test_url()).await.unwrap();
        let admin = connect(&test_url()).await.unwrap();

        let client = db.client().await.unwrap();
        let pid: i32 = client.query_one("SELECT pg_backend_pid()", &[]).await.unwrap().get(0);
        admin
            .client()
            .await
            .unwrap()
            .execute("SELECT pg_terminate_backend($1)", &[&pid])
            .await
            .unwrap();

        // The connection task notices the closed socket asynchronously.
        for _ in 0..50 {
            if client.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(client.is_closed());

        let fresh = db.client().await.unwrap();
        let new_pid: i32 = fresh.query_one("SELECT pg_backend_pid()", &[]).await.unwrap().get(0);
        assert_ne!(pid, new_pid);
        assert_eq!(db.reconnects(), 1);
    }
}
