//! Domain types for balance reconciliation.
//!
//! This module provides:
//! - Integer money (`Cents`) and microsecond timestamps
//! - Accounts, cached balances and ledger entries
//! - Tagged causal-source references
//! - Audit trail rows and query shapes
//! - Discrepancies, processed-event rows and increment records

pub mod audit;
pub mod balance;
pub mod discrepancy;
pub mod event;
pub mod increment;
pub mod ledger;
pub mod money;
pub mod primitives;
pub mod source;

pub use audit::{
    AmountChange, AuditLogEntry, AuditOperation, AuditQuery, AuditSourceType, NewAuditLogEntry,
    SourceRef,
};
pub use balance::{Account, Balance, BalanceField};
pub use discrepancy::{Discrepancy, DiscrepancyDetail, DiscrepancyKind};
pub use event::{MarkProcessed, ProcessedExternalEvent};
pub use increment::IdempotentIncrementRecord;
pub use ledger::{LedgerEntry, NewLedgerEntry};
pub use money::Cents;
pub use primitives::{AccountId, BalanceId, Currency, LedgerEntryId, Timestamp};
pub use source::{CausalSource, SourceError, SourceKind};
