// ABOUTME: Opens PostgreSQL connections with optional TLS, connect timeout and retries
// ABOUTME: PgSession bounds every statement by the configured query timeout

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, Transaction};

use crate::config::{DatabaseConfig, ReplicationSettings, ReplicatorConfig};
use crate::error::DbError;
use crate::sync::traits::Connector;
use crate::utils::retry_with_backoff;

const APPLICATION_NAME: &str = "analytics-replicator";

/// Open a single connection.
///
/// The connection task is spawned onto the runtime; errors it reports after
/// the handshake are logged and surface on the client as closed-connection errors.
pub async fn connect(config: &DatabaseConfig, connect_timeout: Duration) -> Result<Client, DbError> {
    let mut pg = tokio_postgres::Config::new();
    pg.host(&config.host)
        .port(config.port)
        .user(&config.user)
        .dbname(&config.database)
        .application_name(APPLICATION_NAME)
        .connect_timeout(connect_timeout);
    if !config.password.is_empty() {
        pg.password(&config.password);
    }

    match tokio::time::timeout(connect_timeout, open_client(&pg, config)).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout(connect_timeout)),
    }
}

async fn open_client(pg: &tokio_postgres::Config, config: &DatabaseConfig) -> Result<Client, DbError> {
    if config.tls {
        let connector = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| DbError::Client(format!("Failed to build TLS connector: {}", e)))?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);
        let (client, connection) = pg.connect(tls).await.map_err(|e| connect_error(&e))?;
        spawn_connection(connection, config.to_string());
        Ok(client)
    } else {
        let (client, connection) = pg.connect(NoTls).await.map_err(|e| connect_error(&e))?;
        spawn_connection(connection, config.to_string());
        Ok(client)
    }
}

/// Open a connection, retrying with exponential backoff.
pub async fn connect_with_retry(
    config: &DatabaseConfig,
    settings: &ReplicationSettings,
) -> Result<Client, DbError> {
    tracing::debug!("Connecting to {}", config);
    let timeout = settings.connect_timeout();
    retry_with_backoff(
        || connect(config, timeout),
        settings.connect_retries,
        Duration::from_secs(1),
    )
    .await
}

// Anything that fails before the handshake completes is a connectivity problem,
// unless the server answered with an error of its own (bad password, unknown database).
fn connect_error(error: &tokio_postgres::Error) -> DbError {
    match DbError::from_pg(error) {
        DbError::Client(message) => DbError::Connection(message),
        other => other,
    }
}

fn spawn_connection<F>(connection: F, endpoint: String)
where
    F: Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection to {} failed: {}", endpoint, e);
        }
    });
}

/// A connected client whose statements are bounded by a timeout.
pub struct PgSession {
    client: Client,
    query_timeout: Duration,
}

impl PgSession {
    pub fn new(client: Client, query_timeout: Duration) -> Self {
        Self {
            client,
            query_timeout,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Begin a transaction. Statements issued directly on the session run in autocommit mode.
    pub async fn transaction(&mut self) -> Result<Transaction<'_>, DbError> {
        let timeout = self.query_timeout;
        match tokio::time::timeout(timeout, self.client.transaction()).await {
            Ok(Ok(transaction)) => Ok(transaction),
            Ok(Err(e)) => Err(DbError::from_pg(&e)),
            Err(_) => Err(DbError::Timeout(timeout)),
        }
    }

    /// Await a client operation, mapping its error and enforcing the query timeout.
    pub async fn bounded<T, F>(&self, operation: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, tokio_postgres::Error>>,
    {
        match tokio::time::timeout(self.query_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DbError::from_pg(&e)),
            Err(_) => Err(DbError::Timeout(self.query_timeout)),
        }
    }
}

/// Opens sessions to the endpoints of a [`ReplicatorConfig`].
#[derive(Debug, Clone)]
pub struct PgConnector {
    source: DatabaseConfig,
    destination: DatabaseConfig,
    admin: DatabaseConfig,
    settings: ReplicationSettings,
}

impl PgConnector {
    pub fn new(config: &ReplicatorConfig) -> Self {
        Self {
            source: config.source.clone(),
            destination: config.destination.clone(),
            admin: config.destination.with_database(&config.admin_database),
            settings: config.replication.clone(),
        }
    }

    /// Endpoint used for catalog operations on the destination server.
    pub fn admin_config(&self) -> &DatabaseConfig {
        &self.admin
    }

    async fn open(&self, config: &DatabaseConfig) -> Result<PgSession, DbError> {
        let client = connect_with_retry(config, &self.settings).await?;
        Ok(PgSession::new(client, self.settings.query_timeout()))
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Admin = PgSession;
    type Source = PgSession;
    type Destination = PgSession;

    fn destination_database(&self) -> &str {
        &self.destination.database
    }

    async fn admin(&self) -> Result<PgSession, DbError> {
        self.open(&self.admin).await
    }

    async fn source(&self) -> Result<PgSession, DbError> {
        self.open(&self.source).await
    }

    async fn destination(&self) -> Result<PgSession, DbError> {
        self.open(&self.destination).await
    }
}
