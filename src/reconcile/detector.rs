//! Discrepancy detection for a single account.
//!
//! Checks run in a fixed order: calculation mismatch (amount, then holding),
//! external balance, duplicate increments, orphaned entries. Detection is
//! read-only and takes no locks.

use super::aggregation::{entries_by_source, merchant_holding, orphaned_entries, LedgerTotals};
use crate::domain::{
    Account, AccountId, Balance, BalanceField, Cents, Discrepancy, DiscrepancyKind, LedgerEntry,
};
use crate::processor::{ProcessorClient, ProcessorError};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything detection reads for one account, loaded up front.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub account: Account,
    pub balance: Balance,
    /// Live entries including paid ones, oldest first. Sums skip the paid ones.
    pub entries: Vec<LedgerEntry>,
}

/// A check that could not run this time. Not a discrepancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedCheck {
    pub account_id: AccountId,
    pub check: DiscrepancyKind,
    pub reason: String,
}

/// Result of detecting one account.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub discrepancies: Vec<Discrepancy>,
    pub skipped: Vec<SkippedCheck>,
}

#[derive(Debug, Clone)]
pub struct Detector {
    processor: Option<Arc<dyn ProcessorClient>>,
    external_tolerance: Cents,
}

impl Detector {
    /// Without a processor client the external-balance check is not run.
    pub fn new(processor: Option<Arc<dyn ProcessorClient>>, external_tolerance: Cents) -> Self {
        Self {
            processor,
            external_tolerance,
        }
    }

    pub async fn detect(&self, snapshot: &AccountSnapshot) -> Detection {
        let mut detection = Detection {
            discrepancies: calculation_mismatches(snapshot),
            skipped: Vec::new(),
        };

        match self.external_mismatch(snapshot).await {
            Ok(Some(discrepancy)) => detection.discrepancies.push(discrepancy),
            Ok(None) => {}
            Err(skipped) => detection.skipped.push(skipped),
        }

        detection.discrepancies.extend(duplicate_increments(snapshot));
        detection.discrepancies.extend(orphans(snapshot));
        detection
    }

    /// Compare the processor's available balance with the ledger's held amount.
    ///
    /// A failed fetch is not retried; it is reported as a skipped check.
    async fn external_mismatch(
        &self,
        snapshot: &AccountSnapshot,
    ) -> Result<Option<Discrepancy>, SkippedCheck> {
        let (Some(processor), Some(merchant_account_id)) = (
            self.processor.as_ref(),
            snapshot.account.merchant_account_id.as_deref(),
        ) else {
            return Ok(None);
        };
        let currency = &snapshot.balance.currency;

        let actual = match processor
            .fetch_available_balance(merchant_account_id, currency)
            .await
        {
            Ok(actual) => actual,
            Err(err) => {
                match &err {
                    ProcessorError::AlreadyDeauthorized | ProcessorError::KeyModeMismatch => info!(
                        account_id = %snapshot.account.id,
                        merchant_account_id = %merchant_account_id,
                        error = %err,
                        "External balance check not applicable"
                    ),
                    _ => warn!(
                        account_id = %snapshot.account.id,
                        merchant_account_id = %merchant_account_id,
                        error = %err,
                        "External balance fetch failed, skipping check"
                    ),
                }
                return Err(SkippedCheck {
                    account_id: snapshot.account.id,
                    check: DiscrepancyKind::ExternalBalanceMismatch,
                    reason: err.to_string(),
                });
            }
        };

        let expected = merchant_holding(&snapshot.entries, merchant_account_id, currency);
        if actual.within(expected, self.external_tolerance) {
            return Ok(None);
        }
        Ok(Some(Discrepancy::external_balance_mismatch(
            snapshot.account.id,
            merchant_account_id.to_string(),
            currency.clone(),
            expected,
            actual,
        )))
    }
}

/// At most one mismatch per cached field.
pub fn calculation_mismatches(snapshot: &AccountSnapshot) -> Vec<Discrepancy> {
    let totals = LedgerTotals::of(&snapshot.entries);
    [BalanceField::Amount, BalanceField::HoldingAmount]
        .into_iter()
        .filter_map(|field| {
            let expected = totals.get(field);
            let actual = snapshot.balance.get(field);
            (expected != actual).then(|| {
                Discrepancy::calculation_mismatch(
                    snapshot.account.id,
                    snapshot.balance.id,
                    field,
                    expected,
                    actual,
                )
            })
        })
        .collect()
}

pub fn duplicate_increments(snapshot: &AccountSnapshot) -> Vec<Discrepancy> {
    entries_by_source(&snapshot.entries)
        .into_iter()
        .filter(|(_, group)| group.len() > 1)
        .map(|(source, group)| {
            Discrepancy::duplicate_increment(
                snapshot.account.id,
                snapshot.balance.id,
                source,
                group.into_iter().cloned().collect(),
            )
        })
        .collect()
}

pub fn orphans(snapshot: &AccountSnapshot) -> Vec<Discrepancy> {
    orphaned_entries(&snapshot.entries)
        .into_iter()
        .map(|entry| Discrepancy::orphaned_entry(snapshot.account.id, entry.clone()))
        .collect()
}
