//! Append-only audit trail of balance mutations.

use crate::domain::{BalanceId, CausalSource, Cents, LedgerEntryId, SourceKind, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// What kind of mutation an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Increment,
    Decrement,
    TransferIn,
    TransferOut,
    Forfeit,
    Reconciliation,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Increment => "increment",
            AuditOperation::Decrement => "decrement",
            AuditOperation::TransferIn => "transfer_in",
            AuditOperation::TransferOut => "transfer_out",
            AuditOperation::Forfeit => "forfeit",
            AuditOperation::Reconciliation => "reconciliation",
        }
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown audit value: {0}")]
pub struct UnknownAuditValue(pub String);

impl FromStr for AuditOperation {
    type Err = UnknownAuditValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "increment" => Ok(AuditOperation::Increment),
            "decrement" => Ok(AuditOperation::Decrement),
            "transfer_in" => Ok(AuditOperation::TransferIn),
            "transfer_out" => Ok(AuditOperation::TransferOut),
            "forfeit" => Ok(AuditOperation::Forfeit),
            "reconciliation" => Ok(AuditOperation::Reconciliation),
            other => Err(UnknownAuditValue(other.to_string())),
        }
    }
}

/// Type half of the polymorphic source reference on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSourceType {
    LedgerEntry,
    Balance,
    Purchase,
    Dispute,
    Refund,
    Credit,
    ExternalEvent,
}

impl AuditSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSourceType::LedgerEntry => "ledger_entry",
            AuditSourceType::Balance => "balance",
            AuditSourceType::Purchase => "purchase",
            AuditSourceType::Dispute => "dispute",
            AuditSourceType::Refund => "refund",
            AuditSourceType::Credit => "credit",
            AuditSourceType::ExternalEvent => "external_event",
        }
    }
}

impl FromStr for AuditSourceType {
    type Err = UnknownAuditValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ledger_entry" => Ok(AuditSourceType::LedgerEntry),
            "balance" => Ok(AuditSourceType::Balance),
            "purchase" => Ok(AuditSourceType::Purchase),
            "dispute" => Ok(AuditSourceType::Dispute),
            "refund" => Ok(AuditSourceType::Refund),
            "credit" => Ok(AuditSourceType::Credit),
            "external_event" => Ok(AuditSourceType::ExternalEvent),
            other => Err(UnknownAuditValue(other.to_string())),
        }
    }
}

impl From<SourceKind> for AuditSourceType {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Purchase => AuditSourceType::Purchase,
            SourceKind::Dispute => AuditSourceType::Dispute,
            SourceKind::Refund => AuditSourceType::Refund,
            SourceKind::Credit => AuditSourceType::Credit,
        }
    }
}

/// Tagged `(type, id)` pointer back to whatever caused a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_type: AuditSourceType,
    pub source_id: String,
}

impl SourceRef {
    pub fn new(source_type: AuditSourceType, source_id: impl Into<String>) -> Self {
        Self {
            source_type,
            source_id: source_id.into(),
        }
    }

    pub fn ledger_entry(id: LedgerEntryId) -> Self {
        Self::new(AuditSourceType::LedgerEntry, id.to_string())
    }

    pub fn balance(id: BalanceId) -> Self {
        Self::new(AuditSourceType::Balance, id.to_string())
    }

    pub fn external_event(event_id: &str) -> Self {
        Self::new(AuditSourceType::ExternalEvent, event_id)
    }
}

impl From<CausalSource> for SourceRef {
    fn from(source: CausalSource) -> Self {
        Self::new(source.kind.into(), source.id.to_string())
    }
}

/// Before/after snapshot of one monetary figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountChange {
    pub before: Cents,
    pub after: Cents,
}

impl AmountChange {
    pub fn new(before: Cents, after: Cents) -> Self {
        Self { before, after }
    }

    pub fn delta(&self) -> Cents {
        self.after - self.before
    }
}

/// A persisted audit row. There is no way to update or delete one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditLogEntry {
    pub id: i64,
    /// `None` for mutations that are not balance-level (e.g. account transfers).
    pub balance_id: Option<BalanceId>,
    pub operation: AuditOperation,
    pub amount_before: Option<Cents>,
    pub amount_after: Option<Cents>,
    pub holding_before: Option<Cents>,
    pub holding_after: Option<Cents>,
    pub actor: String,
    pub source: Option<SourceRef>,
    pub metadata: serde_json::Value,
    pub created_at: Timestamp,
}

/// Values for an audit row about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditLogEntry {
    pub balance_id: Option<BalanceId>,
    pub operation: AuditOperation,
    pub amount: Option<AmountChange>,
    pub holding: Option<AmountChange>,
    pub actor: String,
    pub source: Option<SourceRef>,
    pub metadata: serde_json::Value,
}

impl NewAuditLogEntry {
    pub fn new(operation: AuditOperation, actor: impl Into<String>) -> Self {
        Self {
            balance_id: None,
            operation,
            amount: None,
            holding: None,
            actor: actor.into(),
            source: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn balance(mut self, balance_id: BalanceId) -> Self {
        self.balance_id = Some(balance_id);
        self
    }

    pub fn amount(mut self, before: Cents, after: Cents) -> Self {
        self.amount = Some(AmountChange::new(before, after));
        self
    }

    pub fn holding(mut self, before: Cents, after: Cents) -> Self {
        self.holding = Some(AmountChange::new(before, after));
        self
    }

    pub fn source(mut self, source: SourceRef) -> Self {
        self.source = Some(source);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// The supported audit read shapes. Each maps onto one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditQuery {
    ByBalance(BalanceId),
    ByOperation {
        operation: AuditOperation,
        from: Timestamp,
        to: Timestamp,
    },
    BySource(SourceRef),
    ByTimeRange {
        from: Timestamp,
        to: Timestamp,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_round_trip() {
        for op in [
            AuditOperation::Increment,
            AuditOperation::Decrement,
            AuditOperation::TransferIn,
            AuditOperation::TransferOut,
            AuditOperation::Forfeit,
            AuditOperation::Reconciliation,
        ] {
            assert_eq!(op.as_str().parse::<AuditOperation>().unwrap(), op);
        }
    }

    #[test]
    fn test_causal_source_maps_to_source_ref() {
        let source_ref: SourceRef = CausalSource::purchase(12).into();
        assert_eq!(source_ref.source_type, AuditSourceType::Purchase);
        assert_eq!(source_ref.source_id, "12");
    }

    #[test]
    fn test_amount_change_delta() {
        assert_eq!(AmountChange::new(Cents(1000), Cents(500)).delta(), Cents(-500));
    }
}
