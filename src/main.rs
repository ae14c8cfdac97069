// ABOUTME: CLI entry point for analytics-replicator
// ABOUTME: Parses commands and routes to schema init, single runs, watermark inspection and daemon mode

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use analytics_replicator::postgres::PgConnector;
use analytics_replicator::sync::{
    ensure_schema, Connector, ReplicationDaemon, RunReport, RunStatus, SchemaReport,
    WatermarkStore,
};
use analytics_replicator::{Registry, ReplicationDriver, ReplicatorConfig};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "analytics-replicator")]
#[command(about = "Incremental PostgreSQL-to-analytics replication", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a TOML configuration file; SRC_DB_* and DEST_DB_* variables override it
    #[arg(long, global = true, env = "REPLICATOR_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the analytics database, tables and foreign keys if missing
    Init,
    /// Replicate rows changed since the last watermark, once
    Run {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the current watermark
    Watermark,
    /// Replicate on a fixed interval until Ctrl+C
    Daemon {
        /// Seconds between runs (overrides replication.interval_secs)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is not an error.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = ReplicatorConfig::load(cli.config.as_deref())
        .context("Failed to load replicator configuration")?;
    tracing::debug!("Loaded configuration: {:?}", config);

    let registry = Registry::analytics().context("Built-in table registry is invalid")?;
    let connector = PgConnector::new(&config);

    match cli.command {
        Commands::Init => init(&connector, &registry).await,
        Commands::Run { json } => {
            let driver = ReplicationDriver::new(connector, registry)
                .with_max_workers(config.replication.max_workers);
            run(&driver, json).await
        }
        Commands::Watermark => watermark(&connector).await,
        Commands::Daemon { interval_secs } => {
            let interval = interval_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.replication.interval());
            if interval.is_zero() {
                bail!("Daemon interval must be greater than zero");
            }
            let driver = ReplicationDriver::new(connector, registry)
                .with_max_workers(config.replication.max_workers);
            daemon(driver, interval).await
        }
    }
}

async fn init(connector: &PgConnector, registry: &Registry) -> anyhow::Result<()> {
    tracing::info!(
        "Ensuring schema of {} tables in database '{}'",
        registry.len(),
        connector.destination_database()
    );
    let report = ensure_schema(connector, registry)
        .await
        .context("Schema initialization failed")?;
    print_schema_report(&report);
    if !report.is_complete() {
        bail!(
            "Schema initialization incomplete: {} tables and {} constraints failed",
            report.failed_tables.len(),
            report.constraints_failed.len()
        );
    }
    Ok(())
}

async fn run(driver: &ReplicationDriver<PgConnector>, json: bool) -> anyhow::Result<()> {
    let report = driver.run().await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize run report")?
        );
    } else {
        print_run_report(&report);
    }

    if report.final_status == RunStatus::Failed {
        bail!(
            "Replication run failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn watermark(connector: &PgConnector) -> anyhow::Result<()> {
    let destination = connector
        .destination()
        .await
        .context("Failed to connect to destination database")?;
    match WatermarkStore::new(&destination).current().await? {
        Some(watermark) => println!("{}", watermark),
        None => println!("No watermark recorded"),
    }
    Ok(())
}

async fn daemon(driver: ReplicationDriver<PgConnector>, interval: Duration) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    // Set up Ctrl+C handler
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    let daemon = ReplicationDaemon::new(Arc::new(driver), interval);
    let stats = daemon.run(shutdown_rx).await;
    println!(
        "Stopped after {} runs ({} succeeded, {} partially failed, {} failed)",
        stats.runs, stats.succeeded, stats.partially_failed, stats.failed
    );
    Ok(())
}

fn print_schema_report(report: &SchemaReport) {
    if report.database_created {
        println!("Created database");
    }
    println!(
        "Tables: {} created, {} already present, {} failed",
        report.tables_created.len(),
        report.tables_present.len(),
        report.failed_tables.len()
    );
    for table in &report.failed_tables {
        println!("  failed: {}", table);
    }
    println!(
        "Foreign keys: {} added, {} already present, {} skipped, {} failed",
        report.constraints_added.len(),
        report.constraints_present.len(),
        report.constraints_skipped.len(),
        report.constraints_failed.len()
    );
    for constraint in &report.constraints_failed {
        println!("  failed: {}", constraint);
    }
}

fn print_run_report(report: &RunReport) {
    println!("Run {} ({} -> {})", report.final_status, report.started_at, report.finished_at);
    if let Some(run_start) = report.run_start {
        println!("Source clock:     {}", run_start);
    }
    if let Some(before) = report.watermark_before {
        println!("Watermark before: {}", before);
    }
    if let Some(after) = report.watermark_after {
        println!("Watermark after:  {}", after);
    }
    for table in &report.tables {
        print!(
            "  {:<50} inserted={:<8} failed={:<8} duplicates={:<8}",
            table.table, table.inserted_count, table.failed_count, table.duplicate_count
        );
        match &table.error {
            Some(error) => println!(" error: {}", error),
            None => println!(),
        }
    }
    if let Some(error) = &report.error {
        println!("Error: {}", error);
    }
}
