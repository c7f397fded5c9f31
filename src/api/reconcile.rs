use axum::{extract::State, Json};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::domain::{AccountId, Discrepancy};
use crate::error::AppError;
use crate::reconcile::{CorrectionOutcome, FailedAccount, SkippedCheck};
use crate::scheduler::{BatchSummary, ReconciliationJob};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcileRequest {
    pub account_id: Option<AccountId>,
    /// Defaults to today (UTC).
    pub date: Option<NaiveDate>,
    pub auto_correct: bool,
    pub dry_run: bool,
}

impl ReconcileRequest {
    pub fn to_job(&self) -> ReconciliationJob {
        ReconciliationJob {
            account_id: self.account_id,
            date: self.date.unwrap_or_else(|| Utc::now().date_naive()),
            auto_correct: self.auto_correct,
            dry_run: self.dry_run,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub run_id: Uuid,
    pub as_of: NaiveDate,
    pub accounts_scanned: u64,
    pub accounts_with_discrepancies: u64,
    pub discrepancy_rate: f64,
    pub discrepancies: Vec<Discrepancy>,
    pub skipped_checks: Vec<SkippedCheck>,
    pub failed_accounts: Vec<FailedAccount>,
    pub corrections: Vec<CorrectionOutcome>,
    pub requeued: Vec<AccountId>,
    pub stopped_early: bool,
    pub rate_alert_raised: bool,
    pub report_path: Option<String>,
}

impl From<BatchSummary> for ReconcileResponse {
    fn from(summary: BatchSummary) -> Self {
        let discrepancy_rate = summary.run.discrepancy_rate();
        Self {
            run_id: summary.run.run_id,
            as_of: summary.run.as_of,
            accounts_scanned: summary.run.accounts_scanned,
            accounts_with_discrepancies: summary.run.accounts_with_discrepancies,
            discrepancy_rate,
            discrepancies: summary.run.discrepancies,
            skipped_checks: summary.run.skipped_checks,
            failed_accounts: summary.run.failed_accounts,
            corrections: summary.corrections,
            requeued: summary.requeued,
            stopped_early: summary.stopped_early,
            rate_alert_raised: summary.rate_alert_raised,
            report_path: summary
                .report_path
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }
}

/// Run reconciliation on demand and return the run summary.
pub async fn post_reconcile(
    State(state): State<AppState>,
    Json(request): Json<ReconcileRequest>,
) -> Result<Json<ReconcileResponse>, AppError> {
    let job = request.to_job();
    let summary = job.run(&state.runner).await?;
    Ok(Json(summary.into()))
}
