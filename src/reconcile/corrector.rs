//! Corrections for detected discrepancies.
//!
//! Each fix is its own transaction: lock the balance row, re-validate what
//! detection saw, mutate, append exactly one audit row, commit. A fix whose
//! precondition no longer holds aborts and the account is re-queued.
//! Orphans and external-balance mismatches are never corrected.

use super::aggregation::LedgerTotals;
use super::{ReconError, RunContext};
use crate::config::ReconcileSettings;
use crate::db::Repository;
use crate::domain::{
    AccountId, AmountChange, AuditOperation, BalanceField, BalanceId, Cents, Discrepancy,
    DiscrepancyDetail, DiscrepancyKind, LedgerEntry, LedgerEntryId, NewAuditLogEntry, SourceRef,
    Timestamp,
};
use crate::notify::{CaseNote, CaseNoteSink};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMode {
    Apply,
    /// Plan corrections against current state without writing anything.
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CorrectionStatus {
    Applied { audit_log_id: i64 },
    Planned,
    /// Root cause already gone; nothing written.
    AlreadyResolved,
    /// Orphans and external mismatches: reported, never corrected.
    NotCorrectable,
    ManualReview { reason: String },
    Requeued { reason: String },
}

impl CorrectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionStatus::Applied { .. } => "applied",
            CorrectionStatus::Planned => "planned",
            CorrectionStatus::AlreadyResolved => "already_resolved",
            CorrectionStatus::NotCorrectable => "not_correctable",
            CorrectionStatus::ManualReview { .. } => "manual_review",
            CorrectionStatus::Requeued { .. } => "requeued",
        }
    }
}

/// What happened (or would happen) for one discrepancy, or one duplicate entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrectionOutcome {
    pub account_id: AccountId,
    pub kind: DiscrepancyKind,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_entry_id: Option<LedgerEntryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<AmountChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holding: Option<AmountChange>,
    pub status: CorrectionStatus,
}

impl CorrectionOutcome {
    fn new(discrepancy: &Discrepancy, status: CorrectionStatus) -> Self {
        Self {
            account_id: discrepancy.account_id,
            kind: discrepancy.kind(),
            fingerprint: discrepancy.fingerprint(),
            ledger_entry_id: None,
            amount: None,
            holding: None,
            status,
        }
    }

    fn entry(mut self, id: LedgerEntryId) -> Self {
        self.ledger_entry_id = Some(id);
        self
    }

    fn change(mut self, field: BalanceField, before: Cents, after: Cents) -> Self {
        let change = Some(AmountChange::new(before, after));
        match field {
            BalanceField::Amount => self.amount = change,
            BalanceField::HoldingAmount => self.holding = change,
        }
        self
    }

    pub fn is_applied(&self) -> bool {
        matches!(self.status, CorrectionStatus::Applied { .. })
    }

    pub fn is_requeued(&self) -> bool {
        matches!(self.status, CorrectionStatus::Requeued { .. })
    }
}

/// In-process exclusive lock per account.
///
/// Serializes correctors inside this process before they reach the database,
/// where the balance-row write lock serializes everyone else.
#[derive(Debug, Default)]
pub struct AccountLocks {
    inner: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
}

impl AccountLocks {
    pub async fn acquire(&self, account_id: AccountId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Entries nobody holds or waits on are dropped.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(account_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone)]
pub struct Corrector {
    repo: Repository,
    settings: ReconcileSettings,
    case_notes: Arc<dyn CaseNoteSink>,
    locks: Arc<AccountLocks>,
}

impl Corrector {
    pub fn new(
        repo: Repository,
        settings: ReconcileSettings,
        case_notes: Arc<dyn CaseNoteSink>,
    ) -> Self {
        Self {
            repo,
            settings,
            case_notes,
            locks: Arc::new(AccountLocks::default()),
        }
    }

    /// Correct `discrepancies` in order.
    ///
    /// Stale preconditions come back as `Requeued` outcomes; any other error
    /// aborts the remaining corrections. Safe to call repeatedly with the same
    /// input: fixes already in place report `AlreadyResolved`.
    pub async fn correct(
        &self,
        ctx: &RunContext,
        discrepancies: &[Discrepancy],
        mode: CorrectionMode,
    ) -> Result<Vec<CorrectionOutcome>, ReconError> {
        let mut outcomes = Vec::with_capacity(discrepancies.len());
        let mut planner = DryRunPlanner::default();

        for discrepancy in discrepancies {
            match &discrepancy.detail {
                DiscrepancyDetail::CalculationMismatch {
                    field,
                    balance_id,
                    expected,
                    actual,
                } => {
                    let delta = (*expected - *actual).abs();
                    let outcome = if let Some(reason) = self.blocked(delta, mode) {
                        self.hold_for_review(discrepancy, reason, mode).await
                    } else if mode == CorrectionMode::DryRun {
                        planner
                            .plan_calculation(&self.repo, discrepancy, *field, *expected)
                            .await?
                    } else {
                        self.requeue_if_stale(
                            discrepancy,
                            self.apply_calculation(
                                ctx,
                                discrepancy,
                                *field,
                                *balance_id,
                                *expected,
                                *actual,
                            )
                            .await,
                        )?
                    };
                    outcomes.push(outcome);
                }
                DiscrepancyDetail::DuplicateIncrement {
                    balance_id,
                    entries,
                    ..
                } => {
                    let Some((kept, later)) = entries.split_first() else {
                        continue;
                    };
                    for duplicate in later {
                        let delta = duplicate.issued_net.abs().max(duplicate.holding_net.abs());
                        let outcome = if !duplicate.is_unpaid() {
                            // Already paid out: the balance no longer holds it.
                            self.hold_for_review(
                                discrepancy,
                                format!("duplicate entry {} already paid out", duplicate.id),
                                mode,
                            )
                            .await
                            .entry(duplicate.id)
                        } else if let Some(reason) = self.blocked(delta, mode) {
                            self.hold_for_review(discrepancy, reason, mode)
                                .await
                                .entry(duplicate.id)
                        } else if mode == CorrectionMode::DryRun {
                            planner
                                .plan_duplicate(&self.repo, discrepancy, duplicate)
                                .await?
                        } else {
                            self.requeue_if_stale(
                                discrepancy,
                                self.apply_duplicate(ctx, discrepancy, *balance_id, kept, duplicate)
                                    .await,
                            )?
                            .entry(duplicate.id)
                        };
                        outcomes.push(outcome);
                    }
                }
                DiscrepancyDetail::OrphanedEntry { entry } => {
                    if mode == CorrectionMode::Apply {
                        self.case_notes
                            .add_note(CaseNote {
                                account_id: discrepancy.account_id,
                                note: format!("Manual review required: {}", discrepancy.message),
                            })
                            .await;
                    }
                    outcomes.push(
                        CorrectionOutcome::new(discrepancy, CorrectionStatus::NotCorrectable)
                            .entry(entry.id),
                    );
                }
                DiscrepancyDetail::ExternalBalanceMismatch { .. } => {
                    outcomes.push(CorrectionOutcome::new(
                        discrepancy,
                        CorrectionStatus::NotCorrectable,
                    ));
                }
            }
        }

        Ok(outcomes)
    }

    /// Reason a correction of size `delta` may not be applied automatically.
    fn blocked(&self, delta: Cents, mode: CorrectionMode) -> Option<String> {
        if mode == CorrectionMode::Apply && !self.settings.auto_correct_enabled {
            return Some("auto-correct disabled".to_string());
        }
        match self.settings.auto_correct_max_amount {
            Some(max) if delta > max => Some(format!(
                "correction of {} exceeds the {} auto-correct ceiling",
                delta, max
            )),
            _ => None,
        }
    }

    async fn hold_for_review(
        &self,
        discrepancy: &Discrepancy,
        reason: String,
        mode: CorrectionMode,
    ) -> CorrectionOutcome {
        if mode == CorrectionMode::Apply {
            self.case_notes
                .add_note(CaseNote {
                    account_id: discrepancy.account_id,
                    note: format!("{} ({})", discrepancy.message, reason),
                })
                .await;
        }
        CorrectionOutcome::new(discrepancy, CorrectionStatus::ManualReview { reason })
    }

    fn requeue_if_stale(
        &self,
        discrepancy: &Discrepancy,
        result: Result<CorrectionOutcome, ReconError>,
    ) -> Result<CorrectionOutcome, ReconError> {
        match result {
            Err(ReconError::StalePrecondition { balance_id, reason }) => {
                warn!(
                    account_id = %discrepancy.account_id,
                    balance_id = %balance_id,
                    kind = %discrepancy.kind(),
                    reason = %reason,
                    "Correction precondition no longer holds, re-queueing account"
                );
                Ok(CorrectionOutcome::new(
                    discrepancy,
                    CorrectionStatus::Requeued { reason },
                ))
            }
            other => other,
        }
    }

    fn audit_metadata(
        &self,
        ctx: &RunContext,
        discrepancy: &Discrepancy,
        extra: serde_json::Value,
    ) -> serde_json::Value {
        let mut metadata = json!({
            "run_id": ctx.run_id.to_string(),
            "as_of": ctx.as_of.to_string(),
            "discrepancy": discrepancy.kind().as_str(),
            "fingerprint": discrepancy.fingerprint(),
        });
        if let (Some(base), serde_json::Value::Object(extra)) = (metadata.as_object_mut(), extra) {
            base.extend(extra);
        }
        metadata
    }

    /// Overwrite one cached figure with the ledger sum.
    async fn apply_calculation(
        &self,
        ctx: &RunContext,
        discrepancy: &Discrepancy,
        field: BalanceField,
        balance_id: BalanceId,
        expected: Cents,
        actual: Cents,
    ) -> Result<CorrectionOutcome, ReconError> {
        let _account = self.locks.acquire(discrepancy.account_id).await;
        let mut tx = self.repo.pool().begin().await?;

        let balance = Repository::lock_balance(&mut *tx, balance_id)
            .await?
            .ok_or(ReconError::BalanceNotFound(discrepancy.account_id))?;
        let entries = Repository::live_unpaid_entries_conn(&mut *tx, balance.account_id).await?;
        let aggregate = LedgerTotals::of(&entries).get(field);
        let cached = balance.get(field);

        if cached == aggregate {
            debug!(
                account_id = %discrepancy.account_id,
                field = field.as_str(),
                "Calculation mismatch already resolved"
            );
            return Ok(CorrectionOutcome::new(
                discrepancy,
                CorrectionStatus::AlreadyResolved,
            ));
        }
        if cached != actual || aggregate != expected {
            return Err(ReconError::StalePrecondition {
                balance_id,
                reason: format!(
                    "{} was {} / ledger {} at detection, now {} / ledger {}",
                    field.as_str(),
                    actual,
                    expected,
                    cached,
                    aggregate
                ),
            });
        }

        let (amount, holding) = match field {
            BalanceField::Amount => (aggregate, balance.holding_amount),
            BalanceField::HoldingAmount => (balance.amount, aggregate),
        };
        let now = Timestamp::now();
        Repository::write_balance_amounts(&mut *tx, balance.id, amount, holding, now).await?;

        let audit = NewAuditLogEntry::new(AuditOperation::Reconciliation, self.settings.actor())
            .balance(balance.id)
            .source(SourceRef::balance(balance.id))
            .metadata(self.audit_metadata(
                ctx,
                discrepancy,
                json!({
                    "field": field.as_str(),
                    "delta": (aggregate - cached).as_i64(),
                }),
            ));
        let audit = match field {
            BalanceField::Amount => audit.amount(cached, aggregate),
            BalanceField::HoldingAmount => audit.holding(cached, aggregate),
        };
        let written = Repository::insert_audit_log(&mut *tx, &audit, now).await?;
        tx.commit().await?;

        info!(
            account_id = %discrepancy.account_id,
            balance_id = %balance.id,
            field = field.as_str(),
            before = %cached,
            after = %aggregate,
            "Corrected balance calculation mismatch"
        );
        Ok(
            CorrectionOutcome::new(
                discrepancy,
                CorrectionStatus::Applied {
                    audit_log_id: written.id,
                },
            )
            .change(field, cached, aggregate),
        )
    }

    /// Back out one later duplicate: decrement, audit, soft-delete.
    async fn apply_duplicate(
        &self,
        ctx: &RunContext,
        discrepancy: &Discrepancy,
        balance_id: BalanceId,
        kept: &LedgerEntry,
        duplicate: &LedgerEntry,
    ) -> Result<CorrectionOutcome, ReconError> {
        let _account = self.locks.acquire(discrepancy.account_id).await;
        let mut tx = self.repo.pool().begin().await?;

        let balance = Repository::lock_balance(&mut *tx, balance_id)
            .await?
            .ok_or(ReconError::BalanceNotFound(discrepancy.account_id))?;

        let current = Repository::get_ledger_entry_conn(&mut *tx, duplicate.id)
            .await?
            .ok_or_else(|| ReconError::StalePrecondition {
                balance_id,
                reason: format!("ledger entry {} no longer exists", duplicate.id),
            })?;
        if current.is_deleted() {
            return Ok(CorrectionOutcome::new(
                discrepancy,
                CorrectionStatus::AlreadyResolved,
            ));
        }
        if !current.is_unpaid() {
            return Err(ReconError::StalePrecondition {
                balance_id,
                reason: format!("ledger entry {} was paid out since detection", current.id),
            });
        }
        let kept_live = Repository::get_ledger_entry_conn(&mut *tx, kept.id)
            .await?
            .map(|e| !e.is_deleted())
            .unwrap_or(false);
        if !kept_live {
            return Err(ReconError::StalePrecondition {
                balance_id,
                reason: format!("kept ledger entry {} is no longer live", kept.id),
            });
        }

        let amount_after = balance.amount - current.issued_net;
        let holding_after = balance.holding_amount - current.holding_net;
        let now = Timestamp::now();
        Repository::write_balance_amounts(&mut *tx, balance.id, amount_after, holding_after, now)
            .await?;

        let audit = NewAuditLogEntry::new(AuditOperation::Reconciliation, self.settings.actor())
            .balance(balance.id)
            .amount(balance.amount, amount_after)
            .holding(balance.holding_amount, holding_after)
            .source(SourceRef::ledger_entry(current.id))
            .metadata(self.audit_metadata(
                ctx,
                discrepancy,
                json!({
                    "causal_source": current.source.map(|s| s.to_string()),
                    "kept_entry_id": kept.id,
                    "removed_entry_id": current.id,
                    "delta": (-current.issued_net).as_i64(),
                    "holding_delta": (-current.holding_net).as_i64(),
                }),
            ));
        let written = Repository::insert_audit_log(&mut *tx, &audit, now).await?;

        if !Repository::soft_delete_ledger_entry(&mut *tx, current.id, now).await? {
            return Err(ReconError::StalePrecondition {
                balance_id,
                reason: format!("ledger entry {} was deleted concurrently", current.id),
            });
        }
        tx.commit().await?;

        info!(
            account_id = %discrepancy.account_id,
            balance_id = %balance.id,
            kept_entry_id = %kept.id,
            removed_entry_id = %current.id,
            "Removed duplicate balance increment"
        );
        Ok(CorrectionOutcome::new(
            discrepancy,
            CorrectionStatus::Applied {
                audit_log_id: written.id,
            },
        )
        .change(BalanceField::Amount, balance.amount, amount_after)
        .change(BalanceField::HoldingAmount, balance.holding_amount, holding_after))
    }
}

/// Simulated balances for a dry run, seeded from the store on first use.
#[derive(Debug, Default)]
struct DryRunPlanner {
    balances: HashMap<AccountId, (Cents, Cents)>,
}

impl DryRunPlanner {
    async fn current(
        &mut self,
        repo: &Repository,
        account_id: AccountId,
    ) -> Result<(Cents, Cents), ReconError> {
        if let Some(current) = self.balances.get(&account_id) {
            return Ok(*current);
        }
        let balance = repo
            .get_balance_for_account(account_id)
            .await?
            .ok_or(ReconError::BalanceNotFound(account_id))?;
        let current = (balance.amount, balance.holding_amount);
        self.balances.insert(account_id, current);
        Ok(current)
    }

    async fn plan_calculation(
        &mut self,
        repo: &Repository,
        discrepancy: &Discrepancy,
        field: BalanceField,
        expected: Cents,
    ) -> Result<CorrectionOutcome, ReconError> {
        let (amount, holding) = self.current(repo, discrepancy.account_id).await?;
        let (before, next) = match field {
            BalanceField::Amount => (amount, (expected, holding)),
            BalanceField::HoldingAmount => (holding, (amount, expected)),
        };
        self.balances.insert(discrepancy.account_id, next);
        Ok(CorrectionOutcome::new(discrepancy, CorrectionStatus::Planned).change(
            field,
            before,
            expected,
        ))
    }

    async fn plan_duplicate(
        &mut self,
        repo: &Repository,
        discrepancy: &Discrepancy,
        duplicate: &LedgerEntry,
    ) -> Result<CorrectionOutcome, ReconError> {
        let (amount, holding) = self.current(repo, discrepancy.account_id).await?;
        let next = (amount - duplicate.issued_net, holding - duplicate.holding_net);
        self.balances.insert(discrepancy.account_id, next);
        Ok(CorrectionOutcome::new(discrepancy, CorrectionStatus::Planned)
            .entry(duplicate.id)
            .change(BalanceField::Amount, amount, next.0)
            .change(BalanceField::HoldingAmount, holding, next.1))
    }
}
