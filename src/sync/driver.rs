// ABOUTME: Replication driver - one run: schema, watermark, per-table extract and load, advance
// ABOUTME: Guards against overlapping runs and optionally replicates tables on a worker pool

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::ReplicationError;
use crate::registry::{Registry, TableSpec};

use super::extractor::DeltaExtractor;
use super::loader::{LoadSummary, Loader};
use super::report::{RunReport, RunStatus, TableReport};
use super::schema::prepare_destination;
use super::traits::{Connector, DeltaSource, RowSink};
use super::watermark::{advance_target, WatermarkStore};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    Idle,
    Initializing,
    Replicating,
    Advancing,
    /// The last run ended with a fatal error.
    Failed,
}

/// Result of replicating one table.
struct TableRun {
    report: TableReport,
    error: Option<ReplicationError>,
}

impl TableRun {
    fn failed(spec: &TableSpec, error: ReplicationError) -> Self {
        Self {
            report: TableReport::new(spec.name, LoadSummary::default(), Some(&error)),
            error: Some(error),
        }
    }
}

// Clears the running flag when a run ends, including by cancellation.
struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { running })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Runs replication from the source into the destination.
///
/// A run:
/// 1. Ensures the destination schema
/// 2. Reads the run start time from the source clock
/// 3. Reads the watermark
/// 4. Extracts and loads every table in registry order
/// 5. Advances the watermark to the run start time
///
/// Only fatal errors (connectivity on either side, schema bootstrap, watermark
/// write) fail a run; they also keep the watermark where it was.
pub struct ReplicationDriver<C: Connector> {
    connector: Arc<C>,
    registry: Arc<Registry>,
    max_workers: usize,
    running: AtomicBool,
    phase: Mutex<RunPhase>,
}

impl<C: Connector> ReplicationDriver<C> {
    pub fn new(connector: C, registry: Registry) -> Self {
        Self {
            connector: Arc::new(connector),
            registry: Arc::new(registry),
            max_workers: 1,
            running: AtomicBool::new(false),
            phase: Mutex::new(RunPhase::Idle),
        }
    }

    /// Replicate up to `max_workers` tables concurrently. `1` (the default) is sequential.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn phase(&self) -> RunPhase {
        match self.phase.lock() {
            Ok(phase) => *phase,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_phase(&self, phase: RunPhase) {
        match self.phase.lock() {
            Ok(mut current) => *current = phase,
            Err(poisoned) => *poisoned.into_inner() = phase,
        }
    }

    /// Execute one replication run.
    ///
    /// Failures are reported through [`RunReport::final_status`]; the only
    /// error returned is [`ReplicationError::AlreadyRunning`] when another run
    /// on this driver has not finished.
    pub async fn run(&self) -> Result<RunReport, ReplicationError> {
        let _guard = match RunGuard::acquire(&self.running) {
            Some(guard) => guard,
            None => {
                tracing::warn!("Replication run requested while another run is in progress");
                return Err(ReplicationError::AlreadyRunning);
            }
        };

        let started_at = Utc::now().naive_utc();
        let mut report = RunReport::new(started_at);
        tracing::info!("Starting replication run at {}", started_at);

        if let Err(e) = self.execute(&mut report).await {
            self.fail(&mut report, e);
        } else {
            report.final_status = report.table_status();
            report.finished_at = Utc::now().naive_utc();
            self.set_phase(RunPhase::Idle);
            tracing::info!(
                "Replication run {}: {} rows inserted, {} failed ({} duplicates) across {} tables",
                report.final_status,
                report.inserted_total(),
                report.failed_total(),
                report.duplicate_total(),
                report.tables.len()
            );
        }

        Ok(report)
    }

    async fn execute(&self, report: &mut RunReport) -> Result<(), ReplicationError> {
        self.set_phase(RunPhase::Initializing);
        let (destination, schema) =
            prepare_destination(self.connector.as_ref(), &self.registry).await?;
        report.schema = Some(schema.clone());

        let source = self
            .connector
            .source()
            .await
            .map_err(|source| ReplicationError::Connectivity {
                target: "source",
                source,
            })?;
        // Source timestamps are naive, so the run start must come from the source's clock.
        let run_start = source
            .clock()
            .await
            .map_err(|source| ReplicationError::Connectivity {
                target: "source",
                source,
            })?;
        report.run_start = Some(run_start);

        let store = WatermarkStore::new(&destination);
        let before = store.read().await;
        report.watermark_before = Some(before);
        report.watermark_after = Some(before);
        tracing::info!(
            "Replicating rows changed after {} (source clock {})",
            before,
            run_start
        );

        self.set_phase(RunPhase::Replicating);
        let mut runnable = Vec::new();
        let mut results: Vec<Option<TableRun>> = Vec::new();
        for spec in self.registry.tables() {
            if schema.table_failed(spec.name) {
                tracing::warn!(
                    "Skipping '{}': table could not be created in the destination",
                    spec.name
                );
                results.push(Some(TableRun {
                    report: TableReport::skipped(
                        spec.name,
                        "table could not be created in the destination",
                    ),
                    error: None,
                }));
            } else {
                runnable.push(results.len());
                results.push(None);
            }
        }

        if self.max_workers <= 1 {
            for index in runnable {
                let spec = &self.registry.tables()[index];
                let run = replicate_table(&source, &destination, spec, before).await;
                let fatal = run.error.clone().filter(ReplicationError::is_fatal);
                results[index] = Some(run);
                if let Some(e) = fatal {
                    report.tables = collect_reports(results);
                    return Err(e);
                }
            }
        } else {
            drop(source);
            self.replicate_parallel(&runnable, before, &mut results).await;
        }

        let fatal = results
            .iter()
            .flatten()
            .filter_map(|run| run.error.clone())
            .find(ReplicationError::is_fatal);
        report.tables = collect_reports(results);
        if let Some(e) = fatal {
            return Err(e);
        }

        self.set_phase(RunPhase::Advancing);
        let target = advance_target(run_start, before);
        store.advance(target).await?;
        report.watermark_after = Some(target);
        Ok(())
    }

    async fn replicate_parallel(
        &self,
        runnable: &[usize],
        since: NaiveDateTime,
        results: &mut [Option<TableRun>],
    ) {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for &index in runnable {
            let spec = self.registry.tables()[index];
            let connector = Arc::clone(&self.connector);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                (index, replicate_with_sessions(connector.as_ref(), &spec, since).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, run)) => results[index] = Some(run),
                Err(e) => tracing::error!("Replication worker failed: {}", e),
            }
        }

        for &index in runnable {
            if results[index].is_none() {
                let spec = &self.registry.tables()[index];
                results[index] = Some(TableRun {
                    report: TableReport::skipped(spec.name, "replication worker aborted"),
                    error: None,
                });
            }
        }
    }

    fn fail(&self, report: &mut RunReport, error: ReplicationError) {
        self.set_phase(RunPhase::Failed);
        tracing::error!("Replication run failed: {}", error);
        report.final_status = RunStatus::Failed;
        report.error = Some(error.to_string());
        report.watermark_after = report.watermark_before;
        report.finished_at = Utc::now().naive_utc();
    }
}

fn collect_reports(results: Vec<Option<TableRun>>) -> Vec<TableReport> {
    results.into_iter().flatten().map(|run| run.report).collect()
}

async fn replicate_with_sessions<C: Connector>(
    connector: &C,
    spec: &TableSpec,
    since: NaiveDateTime,
) -> TableRun {
    let source = match connector.source().await {
        Ok(session) => session,
        Err(source) => {
            return TableRun::failed(
                spec,
                ReplicationError::Connectivity {
                    target: "source",
                    source,
                },
            )
        }
    };
    let destination = match connector.destination().await {
        Ok(session) => session,
        Err(source) => {
            return TableRun::failed(
                spec,
                ReplicationError::Connectivity {
                    target: "destination",
                    source,
                },
            )
        }
    };
    replicate_table(&source, &destination, spec, since).await
}

async fn replicate_table<S, D>(
    source: &S,
    destination: &D,
    spec: &TableSpec,
    since: NaiveDateTime,
) -> TableRun
where
    S: DeltaSource + ?Sized,
    D: RowSink + ?Sized,
{
    tracing::info!(
        "Replicating '{}' ({} > {})",
        spec.name,
        spec.timestamp_column,
        since
    );

    let rows = match DeltaExtractor::new(source).extract(spec, since).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!("Failed to extract '{}': {}", spec.name, e);
            return TableRun::failed(spec, escalate_source_loss(e));
        }
    };

    let outcome = Loader::new(destination).load_rows(spec, rows).await;
    let halted = outcome.halted.map(escalate_source_loss);
    TableRun {
        report: TableReport::new(spec.name, outcome.summary, halted.as_ref()),
        error: halted,
    }
}

// Losing the source ends the run, so the watermark never moves past rows left unread.
fn escalate_source_loss(error: ReplicationError) -> ReplicationError {
    match error {
        ReplicationError::Extraction { source, .. } if source.is_connection_lost() => {
            ReplicationError::Connectivity {
                target: "source",
                source,
            }
        }
        other => other,
    }
}
