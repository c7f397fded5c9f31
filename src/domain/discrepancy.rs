//! Discrepancies found by a reconciliation run.
//!
//! These live only in memory: a run produces them, the corrector consumes
//! them, and the alert/report sinks render them.

use crate::domain::{
    AccountId, BalanceField, BalanceId, CausalSource, Cents, Currency, LedgerEntry, LedgerEntryId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind tag of a discrepancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    BalanceCalculationMismatch,
    HoldingBalanceCalculationMismatch,
    ExternalBalanceMismatch,
    DuplicateBalanceIncrement,
    OrphanedBalanceTransaction,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::BalanceCalculationMismatch => "balance_calculation_mismatch",
            DiscrepancyKind::HoldingBalanceCalculationMismatch => {
                "holding_balance_calculation_mismatch"
            }
            DiscrepancyKind::ExternalBalanceMismatch => "external_balance_mismatch",
            DiscrepancyKind::DuplicateBalanceIncrement => "duplicate_balance_increment",
            DiscrepancyKind::OrphanedBalanceTransaction => "orphaned_balance_transaction",
        }
    }
}

impl fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscrepancyDetail {
    /// Cached figure differs from the ledger sum.
    CalculationMismatch {
        field: BalanceField,
        balance_id: BalanceId,
        /// Ledger-derived value.
        expected: Cents,
        /// Cached value observed at detection time.
        actual: Cents,
    },
    /// Processor-reported balance differs from the ledger's held amount.
    ExternalBalanceMismatch {
        merchant_account_id: String,
        currency: Currency,
        expected: Cents,
        actual: Cents,
    },
    /// More than one live entry for a single causal source, oldest first.
    DuplicateIncrement {
        balance_id: BalanceId,
        source: CausalSource,
        entries: Vec<LedgerEntry>,
    },
    /// A live entry with no causal source.
    OrphanedEntry { entry: LedgerEntry },
}

/// One detected inconsistency on one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub account_id: AccountId,
    pub message: String,
    pub detail: DiscrepancyDetail,
}

impl Discrepancy {
    pub fn calculation_mismatch(
        account_id: AccountId,
        balance_id: BalanceId,
        field: BalanceField,
        expected: Cents,
        actual: Cents,
    ) -> Self {
        let message = format!(
            "balance {} {} is {} but ledger sums to {} (delta {})",
            balance_id,
            field.as_str(),
            actual,
            expected,
            expected - actual
        );
        Self {
            account_id,
            message,
            detail: DiscrepancyDetail::CalculationMismatch {
                field,
                balance_id,
                expected,
                actual,
            },
        }
    }

    pub fn external_balance_mismatch(
        account_id: AccountId,
        merchant_account_id: String,
        currency: Currency,
        expected: Cents,
        actual: Cents,
    ) -> Self {
        let message = format!(
            "processor reports {} {} available on {} but ledger holds {}",
            actual, currency, merchant_account_id, expected
        );
        Self {
            account_id,
            message,
            detail: DiscrepancyDetail::ExternalBalanceMismatch {
                merchant_account_id,
                currency,
                expected,
                actual,
            },
        }
    }

    pub fn duplicate_increment(
        account_id: AccountId,
        balance_id: BalanceId,
        source: CausalSource,
        entries: Vec<LedgerEntry>,
    ) -> Self {
        let message = format!(
            "{} has {} live ledger entries ({})",
            source,
            entries.len(),
            entries
                .iter()
                .map(|e| e.id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self {
            account_id,
            message,
            detail: DiscrepancyDetail::DuplicateIncrement {
                balance_id,
                source,
                entries,
            },
        }
    }

    pub fn orphaned_entry(account_id: AccountId, entry: LedgerEntry) -> Self {
        let message = format!(
            "ledger entry {} (issued {}, holding {}) has no causal source",
            entry.id, entry.issued_net, entry.holding_net
        );
        Self {
            account_id,
            message,
            detail: DiscrepancyDetail::OrphanedEntry { entry },
        }
    }

    pub fn kind(&self) -> DiscrepancyKind {
        match &self.detail {
            DiscrepancyDetail::CalculationMismatch {
                field: BalanceField::Amount,
                ..
            } => DiscrepancyKind::BalanceCalculationMismatch,
            DiscrepancyDetail::CalculationMismatch {
                field: BalanceField::HoldingAmount,
                ..
            } => DiscrepancyKind::HoldingBalanceCalculationMismatch,
            DiscrepancyDetail::ExternalBalanceMismatch { .. } => {
                DiscrepancyKind::ExternalBalanceMismatch
            }
            DiscrepancyDetail::DuplicateIncrement { .. } => {
                DiscrepancyKind::DuplicateBalanceIncrement
            }
            DiscrepancyDetail::OrphanedEntry { .. } => DiscrepancyKind::OrphanedBalanceTransaction,
        }
    }

    /// Ledger entries this discrepancy points at, if any.
    pub fn entry_ids(&self) -> Vec<LedgerEntryId> {
        match &self.detail {
            DiscrepancyDetail::DuplicateIncrement { entries, .. } => {
                entries.iter().map(|e| e.id).collect()
            }
            DiscrepancyDetail::OrphanedEntry { entry } => vec![entry.id],
            _ => Vec::new(),
        }
    }

    /// Stable identifier for the root cause, independent of when it was seen.
    ///
    /// Truncated SHA-256 (128 bits) over the kind, account and the identifying
    /// fields of the payload.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};

        fn hash_var(hasher: &mut Sha256, data: &str) {
            hasher.update((data.len() as u32).to_le_bytes());
            hasher.update(data.as_bytes());
        }

        let mut hasher = Sha256::new();
        hash_var(&mut hasher, self.kind().as_str());
        hasher.update(self.account_id.as_i64().to_le_bytes());
        match &self.detail {
            DiscrepancyDetail::CalculationMismatch {
                balance_id,
                expected,
                actual,
                ..
            } => {
                hasher.update(balance_id.as_i64().to_le_bytes());
                hasher.update(expected.as_i64().to_le_bytes());
                hasher.update(actual.as_i64().to_le_bytes());
            }
            DiscrepancyDetail::ExternalBalanceMismatch {
                merchant_account_id,
                currency,
                ..
            } => {
                hash_var(&mut hasher, merchant_account_id);
                hash_var(&mut hasher, currency.as_str());
            }
            DiscrepancyDetail::DuplicateIncrement { source, .. } => {
                hash_var(&mut hasher, &source.to_string());
            }
            DiscrepancyDetail::OrphanedEntry { .. } => {}
        }
        for id in self.entry_ids() {
            hasher.update(id.as_i64().to_le_bytes());
        }

        let hash = hasher.finalize();
        hex::encode(&hash[..16])
    }
}
