// ABOUTME: Delta extractor - streams source rows changed after the watermark
// ABOUTME: Normalizes each row's timestamp column to canonical YYYY/MM/DD text

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::{DbError, ReplicationError};
use crate::postgres::PgSession;
use crate::registry::TableSpec;
use crate::utils::quote_ident;
use crate::value::{decode_row, DeltaRow, SqlValue};

use super::traits::{DeltaSource, RawRowStream};

/// Lazy, single-pass stream of extracted rows. Row order is unspecified.
pub type DeltaStream<'a> = BoxStream<'a, Result<DeltaRow, ReplicationError>>;

/// `SELECT` statement selecting the delta of `spec`; the watermark is `$1`.
///
/// `$1` is always a `timestamp`, so `timestamptz` and `date` columns are compared
/// in the source session's time zone, the same clock [`DeltaSource::clock`] reads.
pub fn select_query(spec: &TableSpec) -> String {
    let columns = spec
        .columns
        .iter()
        .map(|c| quote_ident(c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {} FROM {} WHERE {} > $1::timestamp",
        columns,
        quote_ident(spec.name),
        quote_ident(spec.timestamp_column.as_str())
    )
}

/// Reads the rows of a table whose timestamp column is after a watermark.
pub struct DeltaExtractor<'a, S: ?Sized> {
    source: &'a S,
}

impl<'a, S: DeltaSource + ?Sized> DeltaExtractor<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Open the delta query for `spec`.
    ///
    /// Opening the query and every fetched row may fail with
    /// [`ReplicationError::Extraction`]; nothing is retried.
    pub async fn extract(
        &self,
        spec: &'a TableSpec,
        watermark: NaiveDateTime,
    ) -> Result<DeltaStream<'a>, ReplicationError> {
        let date_index = spec.timestamp_index().ok_or_else(|| {
            ReplicationError::InvalidRegistry(format!(
                "timestamp column '{}' is not a column of table '{}'",
                spec.timestamp_column, spec.name
            ))
        })?;

        tracing::debug!(
            "Extracting '{}' where {} > {}",
            spec.name,
            spec.timestamp_column,
            watermark
        );

        let raw = self
            .source
            .stream_delta(spec, watermark)
            .await
            .map_err(|source| ReplicationError::Extraction {
                table: spec.name.to_string(),
                source,
            })?;

        let table = spec.name;
        Ok(raw
            .map(move |item| match item {
                Ok(values) => Ok(DeltaRow::new(values).normalize_date(date_index)),
                Err(source) => Err(ReplicationError::Extraction {
                    table: table.to_string(),
                    source,
                }),
            })
            .boxed())
    }
}

#[async_trait]
impl DeltaSource for PgSession {
    async fn stream_delta<'a>(
        &'a self,
        spec: &'a TableSpec,
        since: NaiveDateTime,
    ) -> Result<RawRowStream<'a>, DbError> {
        let query = select_query(spec);
        let rows = self
            .bounded(
                self.client()
                    .query_raw(query.as_str(), [SqlValue::Timestamp(since)]),
            )
            .await?;

        // Each fetch gets its own timeout so a stalled server cannot hang the run.
        let columns = spec.columns;
        let timeout = self.query_timeout();
        let stream = stream::unfold(Some(Box::pin(rows)), move |state| async move {
            let mut rows = match state {
                Some(rows) => rows,
                None => return None,
            };
            match tokio::time::timeout(timeout, rows.next()).await {
                Ok(Some(Ok(row))) => {
                    let decoded = decode_row(&row, columns).map_err(|e| DbError::from_pg(&e));
                    Some((decoded, Some(rows)))
                }
                Ok(Some(Err(e))) => Some((Err(DbError::from_pg(&e)), None)),
                Ok(None) => None,
                Err(_) => Some((Err(DbError::Timeout(timeout)), None)),
            }
        });

        Ok(stream.boxed())
    }

    async fn clock(&self) -> Result<NaiveDateTime, DbError> {
        let row = self
            .bounded(self.client().query_one("SELECT LOCALTIMESTAMP", &[]))
            .await?;
        row.try_get(0).map_err(|e| DbError::from_pg(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::sync::testing::{ts, TestDatabase};

    fn user_spec() -> TableSpec {
        *Registry::analytics()
            .unwrap()
            .get("account_management_user")
            .unwrap()
    }

    fn user_row(id: i64, created_at: &str) -> Vec<SqlValue> {
        vec![
            SqlValue::Int(id),
            SqlValue::Text(format!("user{}", id)),
            SqlValue::Text("NG".into()),
            SqlValue::Bool(true),
            SqlValue::Timestamp(ts(created_at)),
            SqlValue::Timestamp(ts("2024-06-01 09:30:00")),
        ]
    }

    #[test]
    fn test_select_query_projects_declared_columns_in_order() {
        assert_eq!(
            select_query(&user_spec()),
            "SELECT \"id\", \"username\", \"country\", \"is_email_confirmed\", \"created_at\", \"last_login\" \
             FROM \"account_management_user\" WHERE \"created_at\" > $1::timestamp"
        );
    }

    #[tokio::test]
    async fn test_only_rows_after_watermark_are_extracted() {
        let spec = user_spec();
        let db = TestDatabase::new();
        db.insert_source_rows(
            spec.name,
            vec![
                user_row(1, "2023-12-31 23:59:59"),
                user_row(2, "2024-01-01 00:00:00"),
                user_row(3, "2024-01-01 00:00:01"),
                user_row(4, "2024-02-10 12:00:00"),
            ],
        );

        let rows: Vec<DeltaRow> = DeltaExtractor::new(&db)
            .extract(&spec, ts("2024-01-01 00:00:00"))
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;

        let ids: Vec<_> = rows.iter().map(|r| r.values[0].clone()).collect();
        assert_eq!(ids, vec![SqlValue::Int(3), SqlValue::Int(4)]);
    }

    #[tokio::test]
    async fn test_timestamp_column_is_normalized_other_columns_untouched() {
        let spec = user_spec();
        let db = TestDatabase::new();
        db.insert_source_rows(spec.name, vec![user_row(7, "2024-03-05 17:45:00")]);

        let mut rows = DeltaExtractor::new(&db)
            .extract(&spec, ts("2024-01-01 00:00:00"))
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();

        assert_eq!(row.values[4], SqlValue::Text("2024/03/05".into()));
        assert_eq!(row.values[5], SqlValue::Timestamp(ts("2024-06-01 09:30:00")));
        assert_eq!(row.values[1], SqlValue::Text("user7".into()));
        assert!(rows.next().await.is_none());
    }

    #[tokio::test]
    async fn test_open_failure_is_extraction_error() {
        let spec = user_spec();
        let db = TestDatabase::new();
        db.fail_extraction_for(spec.name);

        let result = DeltaExtractor::new(&db).extract(&spec, ts("2024-01-01 00:00:00")).await;
        match result {
            Err(ReplicationError::Extraction { table, .. }) => assert_eq!(table, spec.name),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("extraction should fail"),
        }
    }

    #[tokio::test]
    async fn test_mid_stream_failure_surfaces_as_extraction_error() {
        let spec = user_spec();
        let db = TestDatabase::new();
        db.insert_source_rows(
            spec.name,
            vec![user_row(1, "2024-02-01 00:00:00"), user_row(2, "2024-02-02 00:00:00")],
        );
        db.break_stream_after(spec.name, 1);

        let items: Vec<_> = DeltaExtractor::new(&db)
            .extract(&spec, ts("2024-01-01 00:00:00"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ReplicationError::Extraction { .. })));
    }
}
