//! Job entry points for on-demand and scheduled invocation.

use super::batch::{BatchError, BatchRunner, BatchSummary};
use crate::domain::AccountId;
use crate::idempotency::{EventStore, EventStoreError};
use crate::reconcile::CorrectionMode;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
}

/// Reconcile one account, or every account when `account_id` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationJob {
    pub account_id: Option<AccountId>,
    pub date: NaiveDate,
    pub auto_correct: bool,
    /// Plan corrections without applying them. Implies the correction phase runs.
    pub dry_run: bool,
}

impl ReconciliationJob {
    pub fn mode(&self) -> Option<CorrectionMode> {
        if self.dry_run {
            Some(CorrectionMode::DryRun)
        } else if self.auto_correct {
            Some(CorrectionMode::Apply)
        } else {
            None
        }
    }

    pub async fn run(&self, runner: &BatchRunner) -> Result<BatchSummary, JobError> {
        info!(
            account_id = ?self.account_id.map(|a| a.as_i64()),
            date = %self.date,
            auto_correct = self.auto_correct,
            dry_run = self.dry_run,
            "Running reconciliation job"
        );
        let summary = match self.account_id {
            Some(account_id) => runner.run_account(account_id, self.date, self.mode()).await?,
            None => runner.run_all(self.date, self.mode()).await?,
        };
        Ok(summary)
    }
}

/// Purge processed-event rows past the retention horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupJob {
    pub retention_days: u32,
}

impl CleanupJob {
    pub async fn run(&self, events: &EventStore) -> Result<u64, JobError> {
        let removed = events.cleanup(self.retention_days).await?;
        info!(
            retention_days = self.retention_days,
            removed, "Cleanup job finished"
        );
        Ok(removed)
    }
}
