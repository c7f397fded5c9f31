//! Interval-driven background loops for reconciliation and cleanup.

use super::batch::BatchRunner;
use super::jobs::{CleanupJob, ReconciliationJob};
use crate::idempotency::EventStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

#[derive(Debug)]
pub struct PeriodicScheduler {
    runner: BatchRunner,
    events: EventStore,
    reconcile_interval: Duration,
    cleanup_interval: Duration,
    retention_days: u32,
    auto_correct: bool,
    shutdown: watch::Sender<bool>,
}

impl PeriodicScheduler {
    pub fn new(
        runner: BatchRunner,
        events: EventStore,
        reconcile_interval: Duration,
        cleanup_interval: Duration,
        retention_days: u32,
        auto_correct: bool,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            runner,
            events,
            reconcile_interval,
            cleanup_interval,
            retention_days,
            auto_correct,
            shutdown,
        })
    }

    /// Run both loops until [`PeriodicScheduler::stop`] is called.
    ///
    /// The first run of each job happens one interval after start.
    pub async fn start(self: Arc<Self>) {
        info!(
            reconcile_interval_secs = self.reconcile_interval.as_secs(),
            cleanup_interval_secs = self.cleanup_interval.as_secs(),
            "Scheduler started"
        );

        let reconcile = {
            let scheduler = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = interval_at(
                    Instant::now() + scheduler.reconcile_interval,
                    scheduler.reconcile_interval,
                );
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => scheduler.run_reconciliation().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let cleanup = {
            let scheduler = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = interval_at(
                    Instant::now() + scheduler.cleanup_interval,
                    scheduler.cleanup_interval,
                );
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => scheduler.run_cleanup().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let (reconcile, cleanup) = tokio::join!(reconcile, cleanup);
        for (name, result) in [("reconciliation", reconcile), ("cleanup", cleanup)] {
            if let Err(e) = result {
                error!(task = name, error = %e, "Scheduler loop ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }

    /// Stop both loops. A batch in progress stops between accounts.
    pub fn stop(&self) {
        self.runner.request_stop();
        self.shutdown.send_replace(true);
    }

    async fn run_reconciliation(&self) {
        let job = ReconciliationJob {
            account_id: None,
            date: Utc::now().date_naive(),
            auto_correct: self.auto_correct,
            dry_run: false,
        };
        if let Err(e) = job.run(&self.runner).await {
            error!(error = %e, "Scheduled reconciliation failed");
        }
    }

    async fn run_cleanup(&self) {
        let job = CleanupJob {
            retention_days: self.retention_days,
        };
        if let Err(e) = job.run(&self.events).await {
            error!(error = %e, "Scheduled cleanup failed");
        }
    }
}
