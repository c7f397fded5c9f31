//! Entry points: reconcile one account, reconcile the fleet, auto-correct a result.

use super::corrector::{CorrectionMode, CorrectionOutcome, Corrector};
use super::detector::{AccountSnapshot, Detection, Detector, SkippedCheck};
use super::{ReconError, RunContext};
use crate::config::ReconcileSettings;
use crate::db::Repository;
use crate::domain::{AccountId, Discrepancy, Timestamp};
use crate::notify::CaseNoteSink;
use crate::processor::ProcessorClient;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// An account whose processing failed this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedAccount {
    pub account_id: AccountId,
    pub error: String,
}

/// Discrepancies found by one run over one or many accounts.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub as_of: NaiveDate,
    pub accounts_scanned: u64,
    pub accounts_with_discrepancies: u64,
    pub discrepancies: Vec<Discrepancy>,
    pub skipped_checks: Vec<SkippedCheck>,
    pub failed_accounts: Vec<FailedAccount>,
}

impl RunResult {
    pub fn new(ctx: RunContext) -> Self {
        Self {
            run_id: ctx.run_id,
            as_of: ctx.as_of,
            accounts_scanned: 0,
            accounts_with_discrepancies: 0,
            discrepancies: Vec::new(),
            skipped_checks: Vec::new(),
            failed_accounts: Vec::new(),
        }
    }

    pub fn context(&self) -> RunContext {
        RunContext {
            run_id: self.run_id,
            as_of: self.as_of,
        }
    }

    pub fn record(&mut self, detection: Detection) {
        self.accounts_scanned += 1;
        if !detection.discrepancies.is_empty() {
            self.accounts_with_discrepancies += 1;
        }
        self.discrepancies.extend(detection.discrepancies);
        self.skipped_checks.extend(detection.skipped);
    }

    pub fn record_failure(&mut self, account_id: AccountId, error: &ReconError) {
        self.accounts_scanned += 1;
        self.failed_accounts.push(FailedAccount {
            account_id,
            error: error.to_string(),
        });
    }

    /// Share of scanned accounts with at least one discrepancy.
    pub fn discrepancy_rate(&self) -> f64 {
        if self.accounts_scanned == 0 {
            return 0.0;
        }
        self.accounts_with_discrepancies as f64 / self.accounts_scanned as f64
    }

    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationService {
    repo: Repository,
    detector: Detector,
    corrector: Corrector,
    settings: ReconcileSettings,
}

impl ReconciliationService {
    pub fn new(
        repo: Repository,
        settings: ReconcileSettings,
        processor: Option<Arc<dyn ProcessorClient>>,
        case_notes: Arc<dyn CaseNoteSink>,
    ) -> Self {
        Self {
            detector: Detector::new(processor, settings.external_balance_tolerance),
            corrector: Corrector::new(repo.clone(), settings.clone(), case_notes),
            repo,
            settings,
        }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Load what detection reads for one account. No lock is taken.
    pub async fn load_snapshot(&self, account_id: AccountId) -> Result<AccountSnapshot, ReconError> {
        let account = self
            .repo
            .get_account(account_id)
            .await?
            .ok_or(ReconError::AccountNotFound(account_id))?;
        let balance = self
            .repo
            .get_balance_for_account(account_id)
            .await?
            .ok_or(ReconError::BalanceNotFound(account_id))?;
        let entries = self.repo.live_entries(account_id).await?;
        Ok(AccountSnapshot {
            account,
            balance,
            entries,
        })
    }

    /// Detect one account and log what was found.
    pub async fn detect_account(
        &self,
        ctx: &RunContext,
        account_id: AccountId,
    ) -> Result<Detection, ReconError> {
        let snapshot = self.load_snapshot(account_id).await?;
        let detection = self.detector.detect(&snapshot).await;
        for discrepancy in &detection.discrepancies {
            warn!(
                run_id = %ctx.run_id,
                account_id = %account_id,
                kind = %discrepancy.kind(),
                fingerprint = %discrepancy.fingerprint(),
                "{}",
                discrepancy.message
            );
        }
        Ok(detection)
    }

    pub async fn reconcile(
        &self,
        account_id: AccountId,
        as_of: NaiveDate,
    ) -> Result<RunResult, ReconError> {
        let ctx = RunContext::new(as_of);
        let detection = self.detect_account(&ctx, account_id).await?;
        let mut result = RunResult::new(ctx);
        result.record(detection);
        Ok(result)
    }

    /// Next page of active accounts created on or before `as_of`, ids after `after`.
    ///
    /// Pages are ascending by id and at most `batch_size` long; an empty page
    /// ends the population.
    pub async fn account_page(
        &self,
        after: Option<AccountId>,
        as_of: NaiveDate,
    ) -> Result<Vec<AccountId>, ReconError> {
        let page = self
            .repo
            .list_active_accounts(after, Timestamp::end_of_day(as_of), self.settings.batch_size)
            .await?;
        Ok(page.into_iter().map(|a| a.id).collect())
    }

    /// Detect every active account created on or before `as_of`.
    ///
    /// A failing account is recorded and skipped. Only a failure to page
    /// through the population aborts.
    pub async fn reconcile_all(&self, as_of: NaiveDate) -> Result<RunResult, ReconError> {
        let ctx = RunContext::new(as_of);
        let mut result = RunResult::new(ctx);
        let mut cursor = None;

        loop {
            let ids = self.account_page(cursor, as_of).await?;
            let Some(&last) = ids.last() else {
                break;
            };
            cursor = Some(last);

            for account_id in ids {
                match self.detect_account(&ctx, account_id).await {
                    Ok(detection) => result.record(detection),
                    Err(err) => {
                        warn!(account_id = %account_id, error = %err, "Account reconciliation failed");
                        result.record_failure(account_id, &err);
                    }
                }
            }
        }

        info!(
            run_id = %result.run_id,
            accounts = result.accounts_scanned,
            discrepancies = result.discrepancies.len(),
            failed = result.failed_accounts.len(),
            "Fleet reconciliation scan finished"
        );
        Ok(result)
    }

    /// Apply (or plan) corrections for a previous detection result.
    pub async fn auto_correct(
        &self,
        run: &RunResult,
        mode: CorrectionMode,
    ) -> Result<Vec<CorrectionOutcome>, ReconError> {
        self.corrector
            .correct(&run.context(), &run.discrepancies, mode)
            .await
    }

    /// Corrections for a subset of discrepancies within an existing run.
    pub async fn correct(
        &self,
        ctx: &RunContext,
        discrepancies: &[Discrepancy],
        mode: CorrectionMode,
    ) -> Result<Vec<CorrectionOutcome>, ReconError> {
        self.corrector.correct(ctx, discrepancies, mode).await
    }
}
