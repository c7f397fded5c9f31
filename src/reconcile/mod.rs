//! Reconciliation: aggregate the ledger, detect discrepancies, correct them.

pub mod aggregation;
pub mod corrector;
pub mod detector;
pub mod service;

pub use aggregation::LedgerTotals;
pub use corrector::{
    AccountLocks, CorrectionMode, CorrectionOutcome, CorrectionStatus, Corrector,
};
pub use detector::{AccountSnapshot, Detection, Detector, SkippedCheck};
pub use service::{FailedAccount, ReconciliationService, RunResult};

use crate::domain::{AccountId, BalanceId};
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReconError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),
    #[error("Account {0} has no balance")]
    BalanceNotFound(AccountId),
    #[error("Balance {balance_id} changed since detection: {reason}")]
    StalePrecondition { balance_id: BalanceId, reason: String },
}

/// Identity of one reconciliation run, carried into alerts and audit metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub as_of: NaiveDate,
}

impl RunContext {
    pub fn new(as_of: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            as_of,
        }
    }
}
