// ABOUTME: ReplicationDaemon - runs replication on a fixed interval until shutdown
// ABOUTME: Each run is awaited before the next tick so runs never overlap

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use super::driver::ReplicationDriver;
use super::report::RunStatus;
use super::traits::Connector;

/// Counters from a daemon session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub runs: u64,
    pub succeeded: u64,
    pub partially_failed: u64,
    pub failed: u64,
}

/// Runs the replication driver periodically.
pub struct ReplicationDaemon<C: Connector> {
    driver: Arc<ReplicationDriver<C>>,
    interval: Duration,
}

impl<C: Connector> ReplicationDaemon<C> {
    pub fn new(driver: Arc<ReplicationDriver<C>>, interval: Duration) -> Self {
        Self { driver, interval }
    }

    /// Run until a shutdown signal is received.
    ///
    /// The first run starts immediately. A failed run is logged and the loop
    /// continues; a run in progress when shutdown arrives is abandoned, which
    /// leaves the watermark untouched unless it was already advanced.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> DaemonStats {
        let mut ticker = interval(self.interval);
        // A run longer than the interval delays the next one instead of bunching ticks.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = DaemonStats::default();

        tracing::info!("Starting replication daemon with interval={:?}", self.interval);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping replication daemon");
                    break;
                }
                _ = ticker.tick() => {
                    let cycle = stats.runs + 1;
                    tracing::info!("Starting replication run {}", cycle);

                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during run {}, aborting", cycle);
                            break;
                        }
                        result = self.driver.run() => {
                            stats.runs = cycle;
                            match result {
                                Ok(report) => {
                                    match report.final_status {
                                        RunStatus::Succeeded => stats.succeeded += 1,
                                        RunStatus::PartiallyFailed => stats.partially_failed += 1,
                                        RunStatus::Failed => stats.failed += 1,
                                    }
                                    tracing::info!(
                                        "Replication run {} {}: {} rows inserted",
                                        cycle,
                                        report.final_status,
                                        report.inserted_total()
                                    );
                                }
                                Err(e) => {
                                    stats.failed += 1;
                                    tracing::error!("Replication run {} did not start: {}", cycle, e);
                                }
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(
            "Replication daemon stopped after {} runs ({} succeeded, {} partially failed, {} failed)",
            stats.runs,
            stats.succeeded,
            stats.partially_failed,
            stats.failed
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::sync::testing::TestDatabase;

    #[tokio::test]
    async fn test_daemon_runs_until_shutdown() {
        let db = TestDatabase::new();
        let driver = Arc::new(ReplicationDriver::new(db.clone(), Registry::analytics().unwrap()));
        let daemon = ReplicationDaemon::new(Arc::clone(&driver), Duration::from_millis(20));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { daemon.run(rx).await });
        tokio::time::sleep(Duration::from_millis(70)).await;
        tx.send(()).unwrap();
        let stats = handle.await.unwrap();

        assert!(stats.runs >= 2, "expected at least two runs, got {}", stats.runs);
        assert_eq!(stats.failed, 0);
        // One seed row plus one advance per completed run.
        assert_eq!(db.watermark_history().len() as u64, stats.runs + 1);
    }

    #[tokio::test]
    async fn test_failed_runs_do_not_stop_the_daemon() {
        let db = TestDatabase::new();
        db.refuse_connections("source");
        let driver = Arc::new(ReplicationDriver::new(db.clone(), Registry::analytics().unwrap()));
        let daemon = ReplicationDaemon::new(driver, Duration::from_millis(10));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { daemon.run(rx).await });
        tokio::time::sleep(Duration::from_millis(45)).await;
        tx.send(()).unwrap();
        let stats = handle.await.unwrap();

        assert!(stats.runs >= 2);
        assert_eq!(stats.failed, stats.runs);
        assert_eq!(db.watermark_history().len(), 1);
    }
}
