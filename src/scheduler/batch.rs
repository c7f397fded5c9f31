//! Batch runner: detection and optional correction over many accounts.
//!
//! Accounts are paged in `batch_size` chunks and processed by `workers`
//! concurrent tasks. A failing account is recorded and the batch moves on,
//! unless strict mode is on. A stop request is honored between accounts.

use crate::domain::AccountId;
use crate::notify::{Alert, AlertSink};
use crate::reconcile::{
    CorrectionMode, CorrectionOutcome, Detection, FailedAccount, ReconError,
    ReconciliationService, RunContext, RunResult,
};
use crate::report::write_report_file;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Reconciliation error: {0}")]
    Recon(#[from] ReconError),
    #[error("Account {account_id} failed in strict mode: {source}")]
    Strict {
        account_id: AccountId,
        source: ReconError,
    },
}

/// Outcome of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run: RunResult,
    pub corrections: Vec<CorrectionOutcome>,
    /// Accounts to pick up again next run (stale corrections, failures).
    pub requeued: Vec<AccountId>,
    pub stopped_early: bool,
    pub rate_alert_raised: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

enum AccountReport {
    Done {
        account_id: AccountId,
        detection: Detection,
        outcomes: Vec<CorrectionOutcome>,
    },
    Failed {
        account_id: AccountId,
        detection: Option<Detection>,
        error: ReconError,
    },
    Stopped,
}

impl AccountReport {
    fn account_id(&self) -> Option<AccountId> {
        match self {
            AccountReport::Done { account_id, .. } | AccountReport::Failed { account_id, .. } => {
                Some(*account_id)
            }
            AccountReport::Stopped => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchRunner {
    service: Arc<ReconciliationService>,
    alerts: Arc<dyn AlertSink>,
    stop: Arc<AtomicBool>,
}

impl BatchRunner {
    pub fn new(service: Arc<ReconciliationService>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            service,
            alerts,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn service(&self) -> &Arc<ReconciliationService> {
        &self.service
    }

    /// Ask a running batch to stop after the accounts already in flight.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Allow runs again after a stop.
    pub fn reset_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run over every active account created on or before `as_of`.
    ///
    /// `mode` of `None` detects only.
    pub async fn run_all(
        &self,
        as_of: NaiveDate,
        mode: Option<CorrectionMode>,
    ) -> Result<BatchSummary, BatchError> {
        let settings = self.service.settings().clone();
        let ctx = RunContext::new(as_of);
        let mut tally = Tally::new(ctx);
        let mut cursor = None;

        info!(run_id = %ctx.run_id, as_of = %as_of, mode = ?mode, "Reconciliation batch started");

        loop {
            if self.stop_requested() {
                tally.stopped_early = true;
                break;
            }
            let ids = self.service.account_page(cursor, as_of).await?;
            let Some(&last) = ids.last() else {
                break;
            };
            cursor = Some(last);

            let mut reports: Vec<AccountReport> = stream::iter(ids)
                .map(|account_id| self.process_account(&ctx, account_id, mode))
                .buffer_unordered(settings.workers.max(1))
                .collect()
                .await;
            reports.sort_by_key(|r| r.account_id());

            for report in reports {
                tally.absorb(report, settings.strict)?;
                if settings.progress_every > 0
                    && tally.run.accounts_scanned % settings.progress_every == 0
                    && tally.run.accounts_scanned > 0
                {
                    info!(
                        run_id = %ctx.run_id,
                        processed = tally.run.accounts_scanned,
                        discrepancies = tally.run.discrepancies.len(),
                        "Reconciliation progress"
                    );
                }
            }
            if tally.stopped_early {
                break;
            }
        }

        let mut summary = tally.finish();
        self.maybe_raise_rate_alert(&mut summary, settings.alert_rate_threshold)
            .await;
        if let Some(dir) = settings.report_dir.as_deref() {
            match write_report_file(dir, &summary.run, &summary.corrections) {
                Ok(path) => summary.report_path = Some(path),
                Err(err) => warn!(error = %err, "Failed to write reconciliation report"),
            }
        }

        info!(
            run_id = %summary.run.run_id,
            accounts = summary.run.accounts_scanned,
            accounts_with_discrepancies = summary.run.accounts_with_discrepancies,
            discrepancies = summary.run.discrepancies.len(),
            corrections_applied = summary.corrections.iter().filter(|c| c.is_applied()).count(),
            failed = summary.run.failed_accounts.len(),
            requeued = summary.requeued.len(),
            stopped_early = summary.stopped_early,
            "Reconciliation batch finished"
        );
        Ok(summary)
    }

    /// Run for a single account. No fleet-wide rate alert is raised.
    pub async fn run_account(
        &self,
        account_id: AccountId,
        as_of: NaiveDate,
        mode: Option<CorrectionMode>,
    ) -> Result<BatchSummary, BatchError> {
        let ctx = RunContext::new(as_of);
        let mut tally = Tally::new(ctx);
        // With one account there is no batch to protect; failures go to the caller.
        let report = match self.process_account(&ctx, account_id, mode).await {
            AccountReport::Failed { error, .. } => return Err(BatchError::Recon(error)),
            report => report,
        };
        tally.absorb(report, false)?;
        Ok(tally.finish())
    }

    async fn process_account(
        &self,
        ctx: &RunContext,
        account_id: AccountId,
        mode: Option<CorrectionMode>,
    ) -> AccountReport {
        if self.stop_requested() {
            return AccountReport::Stopped;
        }

        let detection = match self.service.detect_account(ctx, account_id).await {
            Ok(detection) => detection,
            Err(error) => {
                error!(account_id = %account_id, error = %error, "Account detection failed");
                return AccountReport::Failed {
                    account_id,
                    detection: None,
                    error,
                };
            }
        };

        if !detection.discrepancies.is_empty() {
            self.alerts
                .send(
                    Alert::new(
                        "Balance discrepancies detected",
                        json!({
                            "run_id": ctx.run_id.to_string(),
                            "as_of": ctx.as_of.to_string(),
                            "discrepancies": detection.discrepancies.iter().map(|d| json!({
                                "type": d.kind().as_str(),
                                "fingerprint": d.fingerprint(),
                                "message": d.message,
                            })).collect::<Vec<_>>(),
                        }),
                    )
                    .for_account(account_id),
                )
                .await;
        }

        let outcomes = match mode {
            Some(mode) if !detection.discrepancies.is_empty() => {
                match self
                    .service
                    .correct(ctx, &detection.discrepancies, mode)
                    .await
                {
                    Ok(outcomes) => outcomes,
                    Err(error) => {
                        error!(account_id = %account_id, error = %error, "Account correction failed");
                        return AccountReport::Failed {
                            account_id,
                            detection: Some(detection),
                            error,
                        };
                    }
                }
            }
            _ => Vec::new(),
        };

        AccountReport::Done {
            account_id,
            detection,
            outcomes,
        }
    }

    async fn maybe_raise_rate_alert(&self, summary: &mut BatchSummary, threshold: f64) {
        let rate = summary.run.discrepancy_rate();
        if summary.run.accounts_scanned == 0 || rate <= threshold {
            return;
        }
        warn!(
            run_id = %summary.run.run_id,
            rate,
            threshold,
            "Fleet discrepancy rate above threshold"
        );
        self.alerts
            .send(Alert::new(
                "High balance discrepancy rate",
                json!({
                    "run_id": summary.run.run_id.to_string(),
                    "as_of": summary.run.as_of.to_string(),
                    "accounts_scanned": summary.run.accounts_scanned,
                    "accounts_with_discrepancies": summary.run.accounts_with_discrepancies,
                    "rate": rate,
                    "threshold": threshold,
                }),
            ))
            .await;
        summary.rate_alert_raised = true;
    }
}

/// Running totals folded from per-account reports.
struct Tally {
    run: RunResult,
    corrections: Vec<CorrectionOutcome>,
    requeued: BTreeSet<AccountId>,
    stopped_early: bool,
}

impl Tally {
    fn new(ctx: RunContext) -> Self {
        Self {
            run: RunResult::new(ctx),
            corrections: Vec::new(),
            requeued: BTreeSet::new(),
            stopped_early: false,
        }
    }

    fn absorb(&mut self, report: AccountReport, strict: bool) -> Result<(), BatchError> {
        match report {
            AccountReport::Done {
                account_id,
                detection,
                outcomes,
            } => {
                if outcomes.iter().any(|o| o.is_requeued()) {
                    self.requeued.insert(account_id);
                }
                self.run.record(detection);
                self.corrections.extend(outcomes);
            }
            AccountReport::Failed {
                account_id,
                detection,
                error,
            } => {
                if strict {
                    return Err(BatchError::Strict {
                        account_id,
                        source: error,
                    });
                }
                match detection {
                    Some(detection) => {
                        self.run.record(detection);
                        self.run.failed_accounts.push(FailedAccount {
                            account_id,
                            error: error.to_string(),
                        });
                    }
                    None => self.run.record_failure(account_id, &error),
                }
                self.requeued.insert(account_id);
            }
            AccountReport::Stopped => self.stopped_early = true,
        }
        Ok(())
    }

    fn finish(self) -> BatchSummary {
        if !self.requeued.is_empty() {
            info!(
                run_id = %self.run.run_id,
                accounts = ?self.requeued.iter().map(|a| a.as_i64()).collect::<Vec<_>>(),
                "Accounts re-queued for next run"
            );
        }
        BatchSummary {
            run: self.run,
            corrections: self.corrections,
            requeued: self.requeued.into_iter().collect(),
            stopped_early: self.stopped_early,
            rate_alert_raised: false,
            report_path: None,
        }
    }
}
