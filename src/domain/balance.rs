//! Seller accounts and their cached balances.

use crate::domain::{AccountId, BalanceId, Cents, Currency, Timestamp};
use serde::{Deserialize, Serialize};

/// A seller account, optionally backed by a payment-processor sub-account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Processor-side sub-account identifier, when the seller has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_account_id: Option<String>,
    pub created_at: Timestamp,
}

/// Cached aggregate of an account's unpaid ledger entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub id: BalanceId,
    pub account_id: AccountId,
    pub currency: Currency,
    /// Disbursable amount.
    pub amount: Cents,
    /// Held, not yet released amount.
    pub holding_amount: Cents,
    pub updated_at: Timestamp,
}

/// Which of the two cached figures a value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceField {
    Amount,
    HoldingAmount,
}

impl BalanceField {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceField::Amount => "amount",
            BalanceField::HoldingAmount => "holding_amount",
        }
    }
}

impl Balance {
    pub fn get(&self, field: BalanceField) -> Cents {
        match field {
            BalanceField::Amount => self.amount,
            BalanceField::HoldingAmount => self.holding_amount,
        }
    }
}
