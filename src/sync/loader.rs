// ABOUTME: Loader - inserts extracted rows into the destination one row at a time
// ABOUTME: Duplicates and rejected rows are counted and skipped; session failures halt the table

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::error::{DbError, ReplicationError, RowFailure};
use crate::postgres::PgSession;
use crate::registry::TableSpec;
use crate::utils::quote_ident;
use crate::value::DeltaRow;

use super::traits::RowSink;

/// Row counts for one table.
///
/// Duplicates are included in `failed_count` as well as `duplicate_count`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub inserted_count: u64,
    pub failed_count: u64,
    pub duplicate_count: u64,
}

impl LoadSummary {
    /// Failed rows that were not duplicates.
    pub fn rejected_count(&self) -> u64 {
        self.failed_count - self.duplicate_count
    }
}

/// Result of loading one table.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub summary: LoadSummary,
    /// Why loading stopped before the stream was exhausted.
    pub halted: Option<ReplicationError>,
}

/// `INSERT` statement for one row of `spec`.
pub fn insert_query(spec: &TableSpec) -> String {
    let columns = spec
        .columns
        .iter()
        .map(|c| quote_ident(c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=spec.columns.len())
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(spec.name),
        columns,
        placeholders
    )
}

/// Writes extracted rows into the destination.
pub struct Loader<'a, S: ?Sized> {
    sink: &'a S,
}

impl<'a, S: RowSink + ?Sized> Loader<'a, S> {
    pub fn new(sink: &'a S) -> Self {
        Self { sink }
    }

    /// Insert every row of `rows`, isolating row-level failures.
    pub async fn load_rows<R>(&self, spec: &TableSpec, mut rows: R) -> LoadOutcome
    where
        R: Stream<Item = Result<DeltaRow, ReplicationError>> + Unpin,
    {
        let mut summary = LoadSummary::default();
        let mut position = 0u64;

        while let Some(item) = rows.next().await {
            let row = match item {
                Ok(row) => row,
                Err(e) => {
                    tracing::error!("Stopped loading '{}' after {} rows: {}", spec.name, position, e);
                    return LoadOutcome {
                        summary,
                        halted: Some(e),
                    };
                }
            };
            position += 1;

            let error = match self.sink.insert_row(spec, &row).await {
                Ok(()) => {
                    summary.inserted_count += 1;
                    continue;
                }
                Err(e) => e,
            };

            if error.is_connection_lost() {
                tracing::error!(
                    "Lost destination connection while loading '{}' at row {}: {}",
                    spec.name,
                    position,
                    error
                );
                return LoadOutcome {
                    summary,
                    halted: Some(ReplicationError::Connectivity {
                        target: "destination",
                        source: error,
                    }),
                };
            }

            let key = row.key().map(|k| k.to_string()).unwrap_or_default();
            match RowFailure::classify(error.clone()) {
                Some(RowFailure::Duplicate(e)) => {
                    summary.failed_count += 1;
                    summary.duplicate_count += 1;
                    tracing::debug!(
                        "Skipping duplicate row {} (key {}) in '{}': {}",
                        position,
                        key,
                        spec.name,
                        e
                    );
                }
                Some(RowFailure::Rejected(e)) => {
                    summary.failed_count += 1;
                    tracing::warn!(
                        "Rejected row {} (key {}) in '{}' [sqlstate={}]: {}",
                        position,
                        key,
                        spec.name,
                        e.sql_state().unwrap_or("none"),
                        e
                    );
                }
                None => {
                    tracing::error!(
                        "Stopped loading '{}' at row {} (key {}): {}",
                        spec.name,
                        position,
                        key,
                        error
                    );
                    return LoadOutcome {
                        summary,
                        halted: Some(ReplicationError::Load {
                            table: spec.name.to_string(),
                            source: error,
                        }),
                    };
                }
            }
        }

        tracing::info!(
            "Loaded '{}': {} inserted, {} failed ({} duplicates)",
            spec.name,
            summary.inserted_count,
            summary.failed_count,
            summary.duplicate_count
        );

        LoadOutcome {
            summary,
            halted: None,
        }
    }
}

#[async_trait]
impl RowSink for PgSession {
    async fn insert_row(&self, spec: &TableSpec, row: &DeltaRow) -> Result<(), DbError> {
        let query = insert_query(spec);
        self.bounded(self.client().execute(query.as_str(), &row.params()))
            .await?;
        Ok(())
    }
}
