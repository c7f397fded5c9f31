pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod idempotency;
pub mod notify;
pub mod processor;
pub mod reconcile;
pub mod report;
pub mod scheduler;

pub use config::{Config, ReconcileSettings};
pub use db::{init_db, Repository};
pub use domain::{
    Account, AccountId, AuditLogEntry, AuditOperation, AuditQuery, Balance, BalanceId,
    CausalSource, Cents, Currency, Discrepancy, DiscrepancyKind, LedgerEntry, LedgerEntryId,
    Timestamp,
};
pub use error::AppError;
pub use idempotency::{EventStore, IncrementGuard};
pub use notify::{AlertSink, CaseNoteSink, RecordingSink, TracingSink};
pub use processor::{HttpProcessorClient, MockProcessorClient, ProcessorClient};
pub use reconcile::{CorrectionMode, ReconciliationService, RunResult};
pub use scheduler::{BatchRunner, BatchSummary, PeriodicScheduler, ReconciliationJob};
