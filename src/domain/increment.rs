//! Per-source idempotency record for balance increments.

use crate::domain::{CausalSource, LedgerEntryId, Timestamp};
use serde::{Deserialize, Serialize};

/// At most one of these exists per causal source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotentIncrementRecord {
    pub id: i64,
    pub source: CausalSource,
    /// Set once the increment has landed.
    pub ledger_entry_id: Option<LedgerEntryId>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl IdempotentIncrementRecord {
    pub fn is_completed(&self) -> bool {
        self.ledger_entry_id.is_some()
    }
}
