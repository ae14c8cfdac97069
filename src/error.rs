// ABOUTME: Error taxonomy for the replication engine
// ABOUTME: Separates database failures from run-, table- and row-scoped errors

use std::time::Duration;

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// A failure reported by a database session.
///
/// Server errors keep their SQLSTATE so callers can classify them without
/// matching on message text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    /// The connection could not be established or was closed underneath us.
    #[error("connection error: {0}")]
    Connection(String),

    /// The statement did not complete within the configured bound.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// The server rejected the statement.
    #[error("{message} (sqlstate={code})")]
    Server { code: String, message: String },

    /// The statement never reached the server, e.g. a parameter could not be encoded.
    #[error("client error: {0}")]
    Client(String),
}

impl DbError {
    /// Convert a tokio-postgres error, keeping detail and hint when the server sent them.
    pub fn from_pg(error: &tokio_postgres::Error) -> Self {
        if let Some(db_error) = error.as_db_error() {
            let mut message = db_error.message().to_string();
            if let Some(detail) = db_error.detail() {
                message.push_str(&format!(" detail={}", detail));
            }
            if let Some(hint) = db_error.hint() {
                message.push_str(&format!(" hint={}", hint));
            }
            return DbError::Server {
                code: db_error.code().code().to_string(),
                message,
            };
        }

        if error.is_closed() {
            return DbError::Connection(error.to_string());
        }

        // Errors without a server response and an open connection are either
        // I/O failures or local encoding failures; the source chain tells them apart.
        let io_failure = std::error::Error::source(error)
            .map(|source| source.is::<std::io::Error>())
            .unwrap_or(false);
        if io_failure {
            DbError::Connection(error.to_string())
        } else {
            DbError::Client(error.to_string())
        }
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            DbError::Server { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// True for `23505 unique_violation`.
    pub fn is_unique_violation(&self) -> bool {
        self.sql_state() == Some(SqlState::UNIQUE_VIOLATION.code())
    }

    /// True when the session can no longer be used.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DbError::Connection(_))
            || matches!(
                self.sql_state(),
                Some(code) if code.starts_with("08") || code == SqlState::ADMIN_SHUTDOWN.code()
            )
    }

    /// True for errors that describe the row rather than the session:
    /// integrity violations (`23xxx`), data exceptions (`22xxx`) and local encoding failures.
    pub fn is_row_scoped(&self) -> bool {
        match self {
            DbError::Client(_) => true,
            DbError::Server { code, .. } => code.starts_with("23") || code.starts_with("22"),
            _ => false,
        }
    }
}

/// Errors surfaced by the replication engine.
///
/// Which variants end a run is decided by the driver: `Connectivity`,
/// `SchemaBootstrap` and `Watermark` are fatal, `Extraction` and `Load` only
/// cost the table they happened on.
#[derive(Debug, Clone, Error)]
pub enum ReplicationError {
    #[error("cannot reach {target} database: {source}")]
    Connectivity {
        target: &'static str,
        #[source]
        source: DbError,
    },

    #[error("schema bootstrap failed for database '{database}': {source}")]
    SchemaBootstrap {
        database: String,
        #[source]
        source: DbError,
    },

    #[error("failed to extract delta from '{table}': {source}")]
    Extraction {
        table: String,
        #[source]
        source: DbError,
    },

    #[error("failed to load into '{table}': {source}")]
    Load {
        table: String,
        #[source]
        source: DbError,
    },

    #[error("failed to advance watermark: {0}")]
    Watermark(#[source] DbError),

    #[error("a replication run is already in progress")]
    AlreadyRunning,

    #[error("invalid table registry: {0}")]
    InvalidRegistry(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ReplicationError {
    /// Whether this error ends the run and blocks the watermark advance.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplicationError::Connectivity { .. }
                | ReplicationError::SchemaBootstrap { .. }
                | ReplicationError::Watermark(_)
                | ReplicationError::InvalidRegistry(_)
                | ReplicationError::Config(_)
        )
    }
}

/// A row the loader skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RowFailure {
    /// The row is already present; expected when consecutive runs overlap.
    #[error("duplicate row: {0}")]
    Duplicate(DbError),

    /// Constraint or type violation specific to this row.
    #[error("row rejected: {0}")]
    Rejected(DbError),
}

impl RowFailure {
    /// Classify a row-scoped database error. Returns `None` for errors that
    /// concern the session or the table rather than the row.
    pub fn classify(error: DbError) -> Option<Self> {
        if error.is_unique_violation() {
            Some(RowFailure::Duplicate(error))
        } else if error.is_row_scoped() {
            Some(RowFailure::Rejected(error))
        } else {
            None
        }
    }
}

pub type Result<T, E = ReplicationError> = std::result::Result<T, E>;
