// ABOUTME: Watermark store - the high-water mark of the last successful run
// ABOUTME: Persisted as an append-only metadata table in the destination database

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::error::{DbError, ReplicationError};
use crate::postgres::PgSession;

use super::traits::WatermarkTable;

/// Name of the table holding watermark history.
pub const METADATA_TABLE: &str = "metadata";

/// Watermark used when none has been recorded: `1970-01-01 00:00:00`.
pub fn sentinel() -> NaiveDateTime {
    NaiveDateTime::default()
}

/// The timestamp a run advances the watermark to.
///
/// Never moves backwards, even if the local clock is behind the recorded value.
pub fn advance_target(run_start: NaiveDateTime, before: NaiveDateTime) -> NaiveDateTime {
    run_start.max(before)
}

/// Reads and advances the watermark.
///
/// The latest value is the row with the highest `id`; the stored timestamps
/// themselves are never compared.
pub struct WatermarkStore<'a, W: ?Sized> {
    table: &'a W,
}

impl<'a, W: WatermarkTable + ?Sized> WatermarkStore<'a, W> {
    pub fn new(table: &'a W) -> Self {
        Self { table }
    }

    /// Current watermark, falling back to the sentinel when the table is
    /// empty or cannot be read.
    pub async fn read(&self) -> NaiveDateTime {
        match self.table.latest_watermark().await {
            Ok(Some(watermark)) => watermark,
            Ok(None) => {
                tracing::warn!(
                    "No watermark recorded in '{}', replicating from {}",
                    METADATA_TABLE,
                    sentinel()
                );
                sentinel()
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to read watermark from '{}': {}. Replicating from {}",
                    METADATA_TABLE,
                    e,
                    sentinel()
                );
                sentinel()
            }
        }
    }

    /// The recorded watermark without fallback.
    pub async fn current(&self) -> Result<Option<NaiveDateTime>, ReplicationError> {
        self.table
            .latest_watermark()
            .await
            .map_err(ReplicationError::Watermark)
    }

    /// Record a new watermark.
    pub async fn advance(&self, watermark: NaiveDateTime) -> Result<(), ReplicationError> {
        self.table
            .append_watermark(watermark)
            .await
            .map_err(ReplicationError::Watermark)?;
        tracing::info!("Watermark advanced to {}", watermark);
        Ok(())
    }
}

#[async_trait]
impl WatermarkTable for PgSession {
    async fn ensure_watermark_table(&self) -> Result<(), DbError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (id BIGSERIAL PRIMARY KEY, last_update TIMESTAMP NOT NULL)",
            METADATA_TABLE
        );
        self.bounded(self.client().batch_execute(&ddl)).await
    }

    async fn seed_watermark(&self, initial: NaiveDateTime) -> Result<bool, DbError> {
        let query = format!(
            "INSERT INTO {table} (last_update) SELECT $1::timestamp \
             WHERE NOT EXISTS (SELECT 1 FROM {table})",
            table = METADATA_TABLE
        );
        let inserted = self
            .bounded(self.client().execute(&query, &[&initial]))
            .await?;
        Ok(inserted > 0)
    }

    async fn latest_watermark(&self) -> Result<Option<NaiveDateTime>, DbError> {
        let query = format!(
            "SELECT last_update FROM {} ORDER BY id DESC LIMIT 1",
            METADATA_TABLE
        );
        let row = self.bounded(self.client().query_opt(&query, &[])).await?;
        match row {
            Some(row) => row
                .try_get::<_, NaiveDateTime>(0)
                .map(Some)
                .map_err(|e| DbError::from_pg(&e)),
            None => Ok(None),
        }
    }

    async fn append_watermark(&self, watermark: NaiveDateTime) -> Result<(), DbError> {
        let query = format!("INSERT INTO {} (last_update) VALUES ($1)", METADATA_TABLE);
        self.bounded(self.client().execute(&query, &[&watermark]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::{ts, TestDatabase};

    #[tokio::test]
    async fn test_read_empty_table_returns_sentinel() {
        let db = TestDatabase::new();
        let store = WatermarkStore::new(&db);
        assert_eq!(store.read().await, ts("1970-01-01 00:00:00"));
        assert_eq!(store.current().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_unreadable_table_returns_sentinel() {
        let db = TestDatabase::new();
        db.fail_watermark_reads();
        let store = WatermarkStore::new(&db);
        assert_eq!(store.read().await, sentinel());
        assert!(store.current().await.is_err());
    }

    #[tokio::test]
    async fn test_latest_row_wins_even_if_older() {
        let db = TestDatabase::new();
        let store = WatermarkStore::new(&db);
        store.advance(ts("2024-05-01 00:00:00")).await.unwrap();
        store.advance(ts("2024-04-01 00:00:00")).await.unwrap();
        assert_eq!(store.read().await, ts("2024-04-01 00:00:00"));
    }

    #[tokio::test]
    async fn test_seed_only_inserts_into_empty_table() {
        let db = TestDatabase::new();
        assert!(db.seed_watermark(sentinel()).await.unwrap());
        assert!(!db.seed_watermark(ts("2024-01-01 00:00:00")).await.unwrap());
        assert_eq!(db.watermark_history(), vec![sentinel()]);
    }

    #[tokio::test]
    async fn test_advance_failure_is_watermark_error() {
        let db = TestDatabase::new();
        db.fail_watermark_writes();
        let err = WatermarkStore::new(&db)
            .advance(ts("2024-01-01 00:00:00"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Watermark(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_advance_target_never_moves_backwards() {
        let before = ts("2030-01-01 00:00:00");
        let run_start = ts("2024-06-01 12:00:00");
        assert_eq!(advance_target(run_start, before), before);
        assert_eq!(
            advance_target(run_start, ts("2024-01-01 00:00:00")),
            run_start
        );
    }
}
