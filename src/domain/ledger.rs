//! Ledger entries ("balance transactions").

use crate::domain::{AccountId, BalanceId, CausalSource, Cents, Currency, LedgerEntryId, Timestamp};
use serde::{Deserialize, Serialize};

/// One monetary movement on an account.
///
/// Immutable once written. The only permitted change is setting `deleted_at`,
/// and only a correction does that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub account_id: AccountId,
    pub balance_id: BalanceId,
    /// `None` marks an orphan.
    pub source: Option<CausalSource>,
    pub issued_net: Cents,
    pub holding_net: Cents,
    pub currency: Currency,
    /// Processor sub-account the held funds sit in.
    pub merchant_account_id: Option<String>,
    /// Set once the entry has been swept into a payout.
    pub payout_id: Option<i64>,
    pub created_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
}

impl LedgerEntry {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_unpaid(&self) -> bool {
        self.payout_id.is_none()
    }

    pub fn is_orphan(&self) -> bool {
        self.source.is_none()
    }
}

/// Values for a ledger entry about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub account_id: AccountId,
    pub source: Option<CausalSource>,
    pub issued_net: Cents,
    pub holding_net: Cents,
    pub currency: Currency,
    pub merchant_account_id: Option<String>,
    pub created_at: Timestamp,
}

impl NewLedgerEntry {
    pub fn new(
        account_id: AccountId,
        source: Option<CausalSource>,
        issued_net: Cents,
        holding_net: Cents,
    ) -> Self {
        Self {
            account_id,
            source,
            issued_net,
            holding_net,
            currency: Currency::usd(),
            merchant_account_id: None,
            created_at: Timestamp::now(),
        }
    }

    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_merchant_account(mut self, merchant_account_id: impl Into<String>) -> Self {
        self.merchant_account_id = Some(merchant_account_id.into());
        self
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = currency;
        self
    }
}
