//! Traits for the database sessions the replication engine talks to.
//!
//! The engine only depends on these capabilities, which keeps the
//! PostgreSQL session (`crate::postgres::PgSession`) swappable for an
//! in-memory database in tests.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::stream::BoxStream;

use crate::error::DbError;
use crate::registry::TableSpec;
use crate::value::{DeltaRow, SqlValue};

/// Raw source rows, in the table's declared column order.
pub type RawRowStream<'a> = BoxStream<'a, Result<Vec<SqlValue>, DbError>>;

/// Catalog operations on the administrative database.
#[async_trait]
pub trait DatabaseCatalog: Send + Sync {
    async fn database_exists(&self, name: &str) -> Result<bool, DbError>;

    /// Create a database. Must run outside a transaction.
    async fn create_database(&self, name: &str) -> Result<(), DbError>;
}

/// DDL operations on the destination database.
#[async_trait]
pub trait SchemaTarget: Send + Sync {
    /// Names of the tables in the `public` schema.
    async fn existing_tables(&self) -> Result<HashSet<String>, DbError>;

    async fn execute_ddl(&self, ddl: &str) -> Result<(), DbError>;

    async fn constraint_exists(&self, table: &str, constraint: &str) -> Result<bool, DbError>;
}

/// Storage for the replication watermark.
#[async_trait]
pub trait WatermarkTable: Send + Sync {
    /// Create the metadata table if it is missing.
    async fn ensure_watermark_table(&self) -> Result<(), DbError>;

    /// Insert `initial` only if the table holds no row. Returns whether a row was inserted.
    async fn seed_watermark(&self, initial: NaiveDateTime) -> Result<bool, DbError>;

    /// Most recently inserted watermark.
    async fn latest_watermark(&self) -> Result<Option<NaiveDateTime>, DbError>;

    async fn append_watermark(&self, watermark: NaiveDateTime) -> Result<(), DbError>;
}

/// Read side: rows changed after a watermark.
#[async_trait]
pub trait DeltaSource: Send + Sync {
    /// Stream the rows of `spec` whose timestamp column is strictly after `since`.
    async fn stream_delta<'a>(
        &'a self,
        spec: &'a TableSpec,
        since: NaiveDateTime,
    ) -> Result<RawRowStream<'a>, DbError>;

    /// Current time on the source, in the clock its timestamp columns are written in.
    async fn clock(&self) -> Result<NaiveDateTime, DbError>;
}

/// Write side: single-row inserts.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn insert_row(&self, spec: &TableSpec, row: &DeltaRow) -> Result<(), DbError>;
}

/// Opens sessions. Each call returns a fresh, independent connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Admin: DatabaseCatalog;
    type Source: DeltaSource + 'static;
    type Destination: SchemaTarget + WatermarkTable + RowSink + 'static;

    /// Name of the destination database.
    fn destination_database(&self) -> &str;

    async fn admin(&self) -> Result<Self::Admin, DbError>;

    async fn source(&self) -> Result<Self::Source, DbError>;

    async fn destination(&self) -> Result<Self::Destination, DbError>;
}
