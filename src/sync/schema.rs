// ABOUTME: Schema initializer - creates the destination database, tables and foreign keys
// ABOUTME: Idempotent and best-effort per table and per constraint

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{DbError, ReplicationError};
use crate::postgres::PgSession;
use crate::registry::Registry;
use crate::utils::{quote_ident, stored_identifier};

use super::traits::{Connector, DatabaseCatalog, SchemaTarget, WatermarkTable};
use super::watermark::{sentinel, METADATA_TABLE};

const DUPLICATE_DATABASE: &str = "42P04";

/// What [`ensure_schema`] found and changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaReport {
    pub database_created: bool,
    pub tables_created: Vec<String>,
    pub tables_present: Vec<String>,
    /// Tables whose DDL failed; they are not replicated in the same run.
    pub failed_tables: Vec<String>,
    pub constraints_added: Vec<String>,
    pub constraints_present: Vec<String>,
    /// Constraints not attempted because one of their tables is missing.
    pub constraints_skipped: Vec<String>,
    pub constraints_failed: Vec<String>,
}

impl SchemaReport {
    pub fn table_failed(&self, table: &str) -> bool {
        self.failed_tables.iter().any(|t| t == table)
    }

    pub fn is_complete(&self) -> bool {
        self.failed_tables.is_empty() && self.constraints_failed.is_empty()
    }
}

fn bootstrap_error(database: &str, source: DbError) -> ReplicationError {
    ReplicationError::SchemaBootstrap {
        database: database.to_string(),
        source,
    }
}

/// Create the destination database, its tables and their foreign keys.
pub async fn ensure_schema<C: Connector>(
    connector: &C,
    registry: &Registry,
) -> Result<SchemaReport, ReplicationError> {
    let (_destination, report) = prepare_destination(connector, registry).await?;
    Ok(report)
}

/// Like [`ensure_schema`], but hands back the destination session it used.
pub(crate) async fn prepare_destination<C: Connector>(
    connector: &C,
    registry: &Registry,
) -> Result<(C::Destination, SchemaReport), ReplicationError> {
    let database = connector.destination_database().to_string();

    let admin = connector
        .admin()
        .await
        .map_err(|source| ReplicationError::Connectivity {
            target: "admin",
            source,
        })?;
    let database_created = ensure_database(&admin, &database).await?;
    drop(admin);

    let destination =
        connector
            .destination()
            .await
            .map_err(|source| ReplicationError::Connectivity {
                target: "destination",
                source,
            })?;
    let mut report = ensure_tables(&destination, &database, registry).await?;
    report.database_created = database_created;
    Ok((destination, report))
}

/// Create `database` unless it exists. Returns whether it was created.
pub async fn ensure_database<A>(admin: &A, database: &str) -> Result<bool, ReplicationError>
where
    A: DatabaseCatalog + ?Sized,
{
    let exists = admin
        .database_exists(database)
        .await
        .map_err(|e| bootstrap_error(database, e))?;
    if exists {
        tracing::info!("Database '{}' already exists", database);
        return Ok(false);
    }

    match admin.create_database(database).await {
        Ok(()) => {
            tracing::info!("Created database '{}'", database);
            Ok(true)
        }
        // Another process created it between the check and the CREATE.
        Err(e) if e.sql_state() == Some(DUPLICATE_DATABASE) => {
            tracing::info!("Database '{}' already exists", database);
            Ok(false)
        }
        Err(e) => {
            tracing::error!("Failed to create database '{}': {}", database, e);
            Err(bootstrap_error(database, e))
        }
    }
}

/// Create missing tables, the metadata table and the foreign keys.
///
/// A failing table or constraint is logged and recorded in the report;
/// only errors that leave the destination unusable are returned.
pub async fn ensure_tables<T>(
    target: &T,
    database: &str,
    registry: &Registry,
) -> Result<SchemaReport, ReplicationError>
where
    T: SchemaTarget + WatermarkTable + ?Sized,
{
    let mut report = SchemaReport::default();

    let existing = target
        .existing_tables()
        .await
        .map_err(|e| bootstrap_error(database, e))?;

    for spec in registry.tables() {
        if existing.contains(spec.name) {
            tracing::debug!("Table '{}' already exists", spec.name);
            report.tables_present.push(spec.name.to_string());
            continue;
        }

        match target.execute_ddl(spec.create_ddl).await {
            Ok(()) => {
                tracing::info!("Created table '{}'", spec.name);
                report.tables_created.push(spec.name.to_string());
            }
            Err(e) if e.is_connection_lost() => {
                return Err(ReplicationError::Connectivity {
                    target: "destination",
                    source: e,
                })
            }
            Err(e) => {
                tracing::error!("Failed to create table '{}': {}", spec.name, e);
                report.failed_tables.push(spec.name.to_string());
            }
        }
    }

    target
        .ensure_watermark_table()
        .await
        .map_err(|e| bootstrap_error(database, e))?;
    if target
        .seed_watermark(sentinel())
        .await
        .map_err(|e| bootstrap_error(database, e))?
    {
        tracing::info!("Seeded '{}' with initial watermark {}", METADATA_TABLE, sentinel());
    }

    let failed: HashSet<&str> = report.failed_tables.iter().map(String::as_str).collect();
    for fk in registry.constraints() {
        if failed.contains(fk.owning_table) || failed.contains(fk.referenced_table) {
            tracing::warn!(
                "Skipping constraint '{}': table '{}' or '{}' was not created",
                fk.name,
                fk.owning_table,
                fk.referenced_table
            );
            report.constraints_skipped.push(fk.name.to_string());
            continue;
        }

        match target
            .constraint_exists(fk.owning_table, stored_identifier(fk.name))
            .await
        {
            Ok(true) => {
                tracing::debug!("Constraint '{}' already exists", fk.name);
                report.constraints_present.push(fk.name.to_string());
                continue;
            }
            Ok(false) => {}
            Err(e) if e.is_connection_lost() => {
                return Err(ReplicationError::Connectivity {
                    target: "destination",
                    source: e,
                })
            }
            Err(e) => {
                tracing::warn!("Failed to look up constraint '{}': {}", fk.name, e);
                report.constraints_failed.push(fk.name.to_string());
                continue;
            }
        }

        match target.execute_ddl(&fk.to_ddl()).await {
            Ok(()) => {
                tracing::info!(
                    "Added constraint '{}' ({}.{} -> {}.{})",
                    fk.name,
                    fk.owning_table,
                    fk.column,
                    fk.referenced_table,
                    fk.referenced_column
                );
                report.constraints_added.push(fk.name.to_string());
            }
            Err(e) if e.is_connection_lost() => {
                return Err(ReplicationError::Connectivity {
                    target: "destination",
                    source: e,
                })
            }
            Err(e) => {
                tracing::warn!("Failed to add constraint '{}': {}", fk.name, e);
                report.constraints_failed.push(fk.name.to_string());
            }
        }
    }

    tracing::info!(
        "Schema ready: {} tables created, {} present, {} failed; {} constraints added, {} present, {} skipped, {} failed",
        report.tables_created.len(),
        report.tables_present.len(),
        report.failed_tables.len(),
        report.constraints_added.len(),
        report.constraints_present.len(),
        report.constraints_skipped.len(),
        report.constraints_failed.len()
    );

    Ok(report)
}

#[async_trait]
impl DatabaseCatalog for PgSession {
    async fn database_exists(&self, name: &str) -> Result<bool, DbError> {
        let row = self
            .bounded(
                self.client()
                    .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&name]),
            )
            .await?;
        Ok(row.is_some())
    }

    async fn create_database(&self, name: &str) -> Result<(), DbError> {
        // Simple-query protocol: CREATE DATABASE cannot run inside a transaction block.
        let statement = format!("CREATE DATABASE {}", quote_ident(name));
        self.bounded(self.client().batch_execute(&statement)).await
    }
}

#[async_trait]
impl SchemaTarget for PgSession {
    async fn existing_tables(&self) -> Result<HashSet<String>, DbError> {
        let rows = self
            .bounded(self.client().query(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
                &[],
            ))
            .await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(|e| DbError::from_pg(&e)))
            .collect()
    }

    async fn execute_ddl(&self, ddl: &str) -> Result<(), DbError> {
        self.bounded(self.client().batch_execute(ddl)).await
    }

    async fn constraint_exists(&self, table: &str, constraint: &str) -> Result<bool, DbError> {
        let row = self
            .bounded(self.client().query_opt(
                "SELECT 1 FROM pg_constraint c \
                 JOIN pg_class t ON t.oid = c.conrelid \
                 JOIN pg_namespace n ON n.oid = t.relnamespace \
                 WHERE n.nspname = 'public' AND t.relname = $1 AND c.conname = $2",
                &[&table, &constraint],
            ))
            .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::TestDatabase;

    const USER: &str = "account_management_user";
    const USERFILE: &str = "file_management_userfile";

    #[tokio::test]
    async fn test_empty_destination_gets_every_table_then_every_constraint() {
        let db = TestDatabase::new();
        let registry = Registry::analytics().unwrap();

        let report = ensure_schema(&db, &registry).await.unwrap();

        assert!(report.database_created);
        assert_eq!(report.tables_created.len(), 14);
        assert_eq!(report.constraints_added.len(), 11);
        assert!(report.is_complete());
        assert_eq!(db.table_names().len(), 14);
        assert_eq!(db.constraint_count(), 11);
        assert_eq!(db.watermark_history(), vec![sentinel()]);

        // Tables come first, constraints afterwards.
        let ddl = db.executed_ddl();
        let first_alter = ddl.iter().position(|s| s.starts_with("ALTER")).unwrap();
        assert!(ddl[..first_alter].iter().all(|s| s.starts_with("CREATE TABLE")));
        assert_eq!(first_alter, 14);
    }

    #[tokio::test]
    async fn test_running_twice_creates_nothing_new() {
        let db = TestDatabase::new();
        let registry = Registry::analytics().unwrap();

        ensure_schema(&db, &registry).await.unwrap();
        let second = ensure_schema(&db, &registry).await.unwrap();

        assert!(!second.database_created);
        assert!(second.tables_created.is_empty());
        assert_eq!(second.tables_present.len(), 14);
        assert!(second.constraints_added.is_empty());
        assert_eq!(second.constraints_present.len(), 11);
        assert!(second.constraints_failed.is_empty());
        assert_eq!(db.constraint_count(), 11);
        assert_eq!(db.watermark_history().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_table_skips_only_its_constraints() {
        let db = TestDatabase::new();
        db.fail_ddl_for(USERFILE);
        let registry = Registry::analytics().unwrap();

        let report = ensure_schema(&db, &registry).await.unwrap();

        assert_eq!(report.failed_tables, vec![USERFILE.to_string()]);
        assert_eq!(report.tables_created.len(), 13);
        // userfile owns one constraint and is referenced by three others.
        assert_eq!(report.constraints_skipped.len(), 4);
        assert_eq!(report.constraints_added.len(), 7);
        assert!(report.constraints_failed.is_empty());
        assert!(report.table_failed(USERFILE));
        assert!(!report.table_failed(USER));
    }

    #[tokio::test]
    async fn test_existing_database_is_not_recreated() {
        let db = TestDatabase::new();
        db.create_existing_database("analytics");
        assert!(!ensure_database(&db, "analytics").await.unwrap());
    }

    #[tokio::test]
    async fn test_database_creation_failure_is_fatal() {
        let db = TestDatabase::new();
        db.fail_database_creation();
        let registry = Registry::analytics().unwrap();

        let err = ensure_schema(&db, &registry).await.unwrap_err();
        assert!(matches!(err, ReplicationError::SchemaBootstrap { .. }));
        assert!(err.is_fatal());
        assert!(db.table_names().is_empty());
    }

    #[tokio::test]
    async fn test_long_constraint_names_are_matched_after_truncation() {
        let db = TestDatabase::new();
        let registry = Registry::analytics().unwrap();
        ensure_schema(&db, &registry).await.unwrap();

        let long = "finance_management_withdrawrequesttransaction_withdraw_method_id_fkey";
        assert!(db
            .constraint_exists(
                "finance_management_withdrawrequesttransaction",
                stored_identifier(long)
            )
            .await
            .unwrap());
    }
}
