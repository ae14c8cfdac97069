// ABOUTME: In-memory database implementing every session trait, for unit tests
// ABOUTME: Supports failure injection for DDL, extraction, inserts, watermark and connections

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::StreamExt;
use tokio::sync::Semaphore;

use crate::error::DbError;
use crate::registry::TableSpec;
use crate::utils::stored_identifier;
use crate::value::{DeltaRow, SqlValue};

use super::traits::{
    Connector, DatabaseCatalog, DeltaSource, RawRowStream, RowSink, SchemaTarget, WatermarkTable,
};

pub fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn server(code: &str, message: &str) -> DbError {
    DbError::Server {
        code: code.to_string(),
        message: message.to_string(),
    }
}

// Identifier following `keyword` in a DDL statement, without schema or quotes.
fn identifier_after(ddl: &str, keyword: &str) -> Option<String> {
    let mut tokens = ddl.split_whitespace();
    tokens.find(|t| *t == keyword)?;
    let token = tokens.next()?;
    Some(
        token
            .trim_start_matches("public.")
            .trim_end_matches('(')
            .trim_matches('"')
            .to_string(),
    )
}

#[derive(Default)]
struct State {
    databases: HashSet<String>,
    fail_database_creation: bool,
    refused: HashSet<String>,
    sessions_opened: usize,

    tables: BTreeMap<String, Vec<Vec<SqlValue>>>,
    constraints: HashSet<(String, String)>,
    executed_ddl: Vec<String>,
    failing_ddl: HashSet<String>,

    metadata_table: bool,
    watermarks: Vec<NaiveDateTime>,
    fail_watermark_reads: bool,
    fail_watermark_writes: bool,

    source: HashMap<String, Vec<Vec<SqlValue>>>,
    failing_extractions: HashSet<String>,
    broken_streams: HashMap<String, usize>,
    extracted: Vec<String>,
    extraction_gate: Option<Arc<Semaphore>>,
    source_clock: Option<NaiveDateTime>,
    fail_clock: bool,

    rejected_keys: HashMap<String, Vec<SqlValue>>,
    insert_failures: HashMap<String, (usize, DbError)>,
}

/// Source, destination and admin database in one shared in-memory state.
///
/// Clones share state, so every "session" handed out by the connector sees
/// the same data. The destination database is named `analytics`.
#[derive(Clone, Default)]
pub struct TestDatabase {
    state: Arc<Mutex<State>>,
}

impl TestDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn open(&self, target: &str) -> Result<Self, DbError> {
        let mut state = self.lock();
        if state.refused.contains(target) {
            return Err(DbError::Connection(format!("{} refused the connection", target)));
        }
        state.sessions_opened += 1;
        Ok(self.clone())
    }

    // Connections and catalog

    /// Refuse new sessions to `"admin"`, `"source"` or `"destination"`.
    pub fn refuse_connections(&self, target: &str) {
        self.lock().refused.insert(target.to_string());
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    pub fn create_existing_database(&self, name: &str) {
        self.lock().databases.insert(name.to_string());
    }

    pub fn fail_database_creation(&self) {
        self.lock().fail_database_creation = true;
    }

    // Destination schema and rows

    pub fn create_table(&self, name: &str) {
        self.lock().tables.entry(name.to_string()).or_default();
    }

    pub fn fail_ddl_for(&self, table: &str) {
        self.lock().failing_ddl.insert(table.to_string());
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    pub fn constraint_count(&self) -> usize {
        self.lock().constraints.len()
    }

    pub fn executed_ddl(&self) -> Vec<String> {
        self.lock().executed_ddl.clone()
    }

    pub fn rows(&self, table: &str) -> Vec<Vec<SqlValue>> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn clear_rows(&self, table: &str) {
        if let Some(rows) = self.lock().tables.get_mut(table) {
            rows.clear();
        }
    }

    /// Reject inserts of the row whose leading column equals `key`.
    pub fn reject_row(&self, table: &str, key: SqlValue) {
        self.lock()
            .rejected_keys
            .entry(table.to_string())
            .or_default()
            .push(key);
    }

    /// Let `successes` more inserts into `table` through, then fail every insert with `error`.
    pub fn fail_inserts_after(&self, table: &str, successes: usize, error: DbError) {
        self.lock()
            .insert_failures
            .insert(table.to_string(), (successes, error));
    }

    // Watermark

    pub fn set_watermark(&self, watermark: NaiveDateTime) {
        self.lock().watermarks.push(watermark);
    }

    pub fn latest_watermark_value(&self) -> Option<NaiveDateTime> {
        self.lock().watermarks.last().copied()
    }

    pub fn watermark_history(&self) -> Vec<NaiveDateTime> {
        self.lock().watermarks.clone()
    }

    pub fn fail_watermark_reads(&self) {
        self.lock().fail_watermark_reads = true;
    }

    pub fn fail_watermark_writes(&self) {
        self.lock().fail_watermark_writes = true;
    }

    // Source

    pub fn insert_source_rows(&self, table: &str, rows: Vec<Vec<SqlValue>>) {
        self.lock()
            .source
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn fail_extraction_for(&self, table: &str) {
        self.lock().failing_extractions.insert(table.to_string());
    }

    /// Fail the delta stream of `table` after `rows` rows.
    pub fn break_stream_after(&self, table: &str, rows: usize) {
        self.lock().broken_streams.insert(table.to_string(), rows);
    }

    /// Pin the source clock; by default it reads the host's UTC time.
    pub fn set_source_clock(&self, now: NaiveDateTime) {
        self.lock().source_clock = Some(now);
    }

    pub fn fail_source_clock(&self) {
        self.lock().fail_clock = true;
    }

    pub fn extracted_tables(&self) -> Vec<String> {
        self.lock().extracted.clone()
    }

    /// Block every extraction until permits are added to the returned semaphore.
    pub fn hold_extraction(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().extraction_gate = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl DatabaseCatalog for TestDatabase {
    async fn database_exists(&self, name: &str) -> Result<bool, DbError> {
        Ok(self.lock().databases.contains(name))
    }

    async fn create_database(&self, name: &str) -> Result<(), DbError> {
        let mut state = self.lock();
        if state.fail_database_creation {
            return Err(server("42501", "permission denied to create database"));
        }
        if !state.databases.insert(name.to_string()) {
            return Err(server("42P04", "database already exists"));
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaTarget for TestDatabase {
    async fn existing_tables(&self) -> Result<HashSet<String>, DbError> {
        Ok(self.lock().tables.keys().cloned().collect())
    }

    async fn execute_ddl(&self, ddl: &str) -> Result<(), DbError> {
        let mut state = self.lock();
        state.executed_ddl.push(ddl.trim().to_string());

        if ddl.trim_start().starts_with("CREATE TABLE") {
            let table = identifier_after(ddl, "EXISTS")
                .ok_or_else(|| server("42601", "syntax error"))?;
            if state.failing_ddl.contains(&table) {
                return Err(server("42601", "syntax error at or near \"(\""));
            }
            state.tables.entry(table).or_default();
            return Ok(());
        }

        if ddl.trim_start().starts_with("ALTER TABLE") {
            let (owner, name, referenced) = match (
                identifier_after(ddl, "EXISTS"),
                identifier_after(ddl, "CONSTRAINT"),
                identifier_after(ddl, "REFERENCES"),
            ) {
                (Some(owner), Some(name), Some(referenced)) => (owner, name, referenced),
                _ => return Err(server("42601", "syntax error")),
            };
            // ALTER TABLE IF EXISTS on a missing table is a no-op.
            if !state.tables.contains_key(&owner) {
                return Ok(());
            }
            if !state.tables.contains_key(&referenced) {
                return Err(server("42P01", "relation does not exist"));
            }
            let key = (owner, stored_identifier(&name).to_string());
            if state.constraints.contains(&key) {
                return Err(server("42710", "constraint already exists"));
            }
            state.constraints.insert(key);
        }

        Ok(())
    }

    async fn constraint_exists(&self, table: &str, constraint: &str) -> Result<bool, DbError> {
        Ok(self
            .lock()
            .constraints
            .contains(&(table.to_string(), constraint.to_string())))
    }
}

#[async_trait]
impl WatermarkTable for TestDatabase {
    async fn ensure_watermark_table(&self) -> Result<(), DbError> {
        self.lock().metadata_table = true;
        Ok(())
    }

    async fn seed_watermark(&self, initial: NaiveDateTime) -> Result<bool, DbError> {
        let mut state = self.lock();
        if state.watermarks.is_empty() {
            state.watermarks.push(initial);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn latest_watermark(&self) -> Result<Option<NaiveDateTime>, DbError> {
        let state = self.lock();
        if state.fail_watermark_reads {
            return Err(server("42P01", "relation \"metadata\" does not exist"));
        }
        Ok(state.watermarks.last().copied())
    }

    async fn append_watermark(&self, watermark: NaiveDateTime) -> Result<(), DbError> {
        let mut state = self.lock();
        if state.fail_watermark_writes {
            return Err(server(
                "25006",
                "cannot execute INSERT in a read-only transaction",
            ));
        }
        state.watermarks.push(watermark);
        Ok(())
    }
}

#[async_trait]
impl DeltaSource for TestDatabase {
    async fn stream_delta<'a>(
        &'a self,
        spec: &'a TableSpec,
        since: NaiveDateTime,
    ) -> Result<RawRowStream<'a>, DbError> {
        let gate = self.lock().extraction_gate.clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }

        let mut state = self.lock();
        state.extracted.push(spec.name.to_string());
        if state.failing_extractions.contains(spec.name) {
            return Err(server("42P01", "relation does not exist"));
        }

        let index = spec
            .timestamp_index()
            .ok_or_else(|| DbError::Client("unknown timestamp column".to_string()))?;
        let mut items: Vec<Result<Vec<SqlValue>, DbError>> = state
            .source
            .get(spec.name)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|row| {
                row.get(index)
                    .and_then(SqlValue::as_timestamp)
                    .map_or(false, |t| t > since)
            })
            .map(Ok)
            .collect();

        if let Some(&after) = state.broken_streams.get(spec.name) {
            items.truncate(after);
            items.push(Err(DbError::Connection(
                "server closed the connection unexpectedly".to_string(),
            )));
        }

        Ok(futures::stream::iter(items).boxed())
    }

    async fn clock(&self) -> Result<NaiveDateTime, DbError> {
        let state = self.lock();
        if state.fail_clock {
            return Err(DbError::Timeout(std::time::Duration::from_secs(30)));
        }
        Ok(state
            .source_clock
            .unwrap_or_else(|| chrono::Utc::now().naive_utc()))
    }
}

#[async_trait]
impl RowSink for TestDatabase {
    async fn insert_row(&self, spec: &TableSpec, row: &DeltaRow) -> Result<(), DbError> {
        let mut state = self.lock();

        if let Some((remaining, error)) = state.insert_failures.get_mut(spec.name) {
            if *remaining == 0 {
                return Err(error.clone());
            }
            *remaining -= 1;
        }

        let rejected = match (state.rejected_keys.get(spec.name), row.key()) {
            (Some(keys), Some(key)) => keys.contains(key),
            _ => false,
        };
        if rejected {
            return Err(server(
                "23502",
                "null value in column violates not-null constraint",
            ));
        }

        let rows = state
            .tables
            .get_mut(spec.name)
            .ok_or_else(|| server("42P01", "relation does not exist"))?;
        if rows.iter().any(|existing| existing.first() == row.key()) {
            return Err(server(
                "23505",
                "duplicate key value violates unique constraint",
            ));
        }
        rows.push(row.values.clone());
        Ok(())
    }
}

#[async_trait]
impl Connector for TestDatabase {
    type Admin = TestDatabase;
    type Source = TestDatabase;
    type Destination = TestDatabase;

    fn destination_database(&self) -> &str {
        "analytics"
    }

    async fn admin(&self) -> Result<TestDatabase, DbError> {
        self.open("admin")
    }

    async fn source(&self) -> Result<TestDatabase, DbError> {
        self.open("source")
    }

    async fn destination(&self) -> Result<TestDatabase, DbError> {
        self.open("destination")
    }
}
