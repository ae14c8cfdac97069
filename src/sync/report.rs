// ABOUTME: Run report - per-table counts, watermark movement and final status of a run
// ABOUTME: Serializable to JSON for the `run --json` command

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::ReplicationError;

use super::loader::LoadSummary;
use super::schema::SchemaReport;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// Every table replicated without a rejected row.
    Succeeded,
    /// The watermark advanced but some tables or rows failed.
    PartiallyFailed,
    /// A fatal error stopped the run; the watermark did not move.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartiallyFailed => "partially failed",
            RunStatus::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub inserted_count: u64,
    pub failed_count: u64,
    pub duplicate_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableReport {
    pub fn new(table: &str, summary: LoadSummary, error: Option<&ReplicationError>) -> Self {
        Self {
            table: table.to_string(),
            inserted_count: summary.inserted_count,
            failed_count: summary.failed_count,
            duplicate_count: summary.duplicate_count,
            error: error.map(|e| e.to_string()),
        }
    }

    /// A table that was not replicated at all.
    pub fn skipped(table: &str, reason: impl Into<String>) -> Self {
        Self {
            table: table.to_string(),
            inserted_count: 0,
            failed_count: 0,
            duplicate_count: 0,
            error: Some(reason.into()),
        }
    }

    pub fn summary(&self) -> LoadSummary {
        LoadSummary {
            inserted_count: self.inserted_count,
            failed_count: self.failed_count,
            duplicate_count: self.duplicate_count,
        }
    }

    /// True if the table errored or rejected a row that was not a duplicate.
    pub fn has_failures(&self) -> bool {
        self.error.is_some() || self.summary().rejected_count() > 0
    }
}

/// Outcome of one replication run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Host time, UTC.
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    /// Source clock when the run started; the watermark advances to this value.
    pub run_start: Option<NaiveDateTime>,
    /// Watermark read at the start of the run; absent if the run failed before reading it.
    pub watermark_before: Option<NaiveDateTime>,
    /// Watermark in effect after the run.
    pub watermark_after: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaReport>,
    pub tables: Vec<TableReport>,
    pub final_status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn new(started_at: NaiveDateTime) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            run_start: None,
            watermark_before: None,
            watermark_after: None,
            schema: None,
            tables: Vec::new(),
            final_status: RunStatus::Succeeded,
            error: None,
        }
    }

    /// Status implied by the table results, ignoring fatal errors.
    pub fn table_status(&self) -> RunStatus {
        if self.tables.iter().any(TableReport::has_failures) {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn inserted_total(&self) -> u64 {
        self.tables.iter().map(|t| t.inserted_count).sum()
    }

    pub fn failed_total(&self) -> u64 {
        self.tables.iter().map(|t| t.failed_count).sum()
    }

    pub fn duplicate_total(&self) -> u64 {
        self.tables.iter().map(|t| t.duplicate_count).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }
}
