//! At most one balance increment per causal source.

use crate::db::Repository;
use crate::domain::{
    AccountId, AuditOperation, CausalSource, IdempotentIncrementRecord, LedgerEntry,
    LedgerEntryId, NewAuditLogEntry, NewLedgerEntry, Timestamp,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("Increment record {record_id} already completed by ledger entry {ledger_entry_id}")]
    AlreadyCompleted {
        record_id: i64,
        ledger_entry_id: LedgerEntryId,
    },
    #[error("Ledger entry {0} not found")]
    LedgerEntryNotFound(LedgerEntryId),
    #[error("Account {0} has no balance")]
    BalanceNotFound(AccountId),
    #[error("A guarded increment needs a causal source")]
    MissingSource,
}

/// Result of [`IncrementGuard::apply_increment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementOutcome {
    pub record: IdempotentIncrementRecord,
    pub ledger_entry: LedgerEntry,
    /// False when an earlier call had already applied this source.
    pub applied: bool,
}

#[derive(Debug, Clone)]
pub struct IncrementGuard {
    repo: Repository,
}

impl IncrementGuard {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Create the pending record for `source`, or return the one that exists.
    ///
    /// Losing a creation race is not an error: the loser gets the winner's record.
    pub async fn ensure_increment_record(
        &self,
        source: CausalSource,
    ) -> Result<IdempotentIncrementRecord, GuardError> {
        let mut conn = self.repo.pool().acquire().await?;
        let (record, created) =
            Repository::upsert_increment_record(&mut *conn, source, Timestamp::now()).await?;
        debug!(source = %source, record_id = record.id, created, "Ensured increment record");
        Ok(record)
    }

    /// Attach the fulfilling ledger entry to `record`.
    ///
    /// Repeating the call with the same entry returns the completed record;
    /// a different entry is rejected.
    pub async fn complete(
        &self,
        record: &IdempotentIncrementRecord,
        ledger_entry_id: LedgerEntryId,
    ) -> Result<IdempotentIncrementRecord, GuardError> {
        if self.repo.get_ledger_entry(ledger_entry_id).await?.is_none() {
            return Err(GuardError::LedgerEntryNotFound(ledger_entry_id));
        }

        let mut conn = self.repo.pool().acquire().await?;
        Repository::complete_increment_record(&mut *conn, record.id, ledger_entry_id, Timestamp::now())
            .await?;
        let current = Repository::increment_record_by_id(&mut *conn, record.id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        match current.ledger_entry_id {
            Some(existing) if existing == ledger_entry_id => Ok(current),
            Some(existing) => Err(GuardError::AlreadyCompleted {
                record_id: current.id,
                ledger_entry_id: existing,
            }),
            None => Err(GuardError::Db(sqlx::Error::RowNotFound)),
        }
    }

    /// Credit a balance for `entry.source` unless that source was already credited.
    ///
    /// Record, ledger entry, balance update, `increment` audit row and record
    /// completion commit together. Retried or concurrent callers for the same
    /// source get back the first call's ledger entry with `applied == false`.
    pub async fn apply_increment(
        &self,
        entry: NewLedgerEntry,
        actor: &str,
    ) -> Result<IncrementOutcome, GuardError> {
        let source = entry.source.ok_or(GuardError::MissingSource)?;
        let now = Timestamp::now();
        let mut tx = self.repo.pool().begin().await?;

        // The insert is the first statement, so the transaction holds the
        // write lock before it reads the record.
        let (record, _) = Repository::upsert_increment_record(&mut *tx, source, now).await?;
        if let Some(existing) = record.ledger_entry_id {
            let ledger_entry = Repository::get_ledger_entry_conn(&mut *tx, existing)
                .await?
                .ok_or(GuardError::LedgerEntryNotFound(existing))?;
            tx.commit().await?;
            debug!(source = %source, ledger_entry_id = %existing, "Increment already applied");
            return Ok(IncrementOutcome {
                record,
                ledger_entry,
                applied: false,
            });
        }

        let balance = Repository::lock_account_balance(&mut *tx, entry.account_id)
            .await?
            .ok_or(GuardError::BalanceNotFound(entry.account_id))?;
        let ledger_entry = Repository::insert_ledger_entry_conn(&mut *tx, &entry, balance.id).await?;

        let amount_after = balance.amount + entry.issued_net;
        let holding_after = balance.holding_amount + entry.holding_net;
        Repository::write_balance_amounts(&mut *tx, balance.id, amount_after, holding_after, now)
            .await?;

        let audit = NewAuditLogEntry::new(AuditOperation::Increment, actor)
            .balance(balance.id)
            .amount(balance.amount, amount_after)
            .holding(balance.holding_amount, holding_after)
            .source(source.into())
            .metadata(json!({
                "ledger_entry_id": ledger_entry.id,
                "increment_record_id": record.id,
            }));
        Repository::insert_audit_log(&mut *tx, &audit, now).await?;

        Repository::complete_increment_record(&mut *tx, record.id, ledger_entry.id, now).await?;
        let record = Repository::increment_record_by_id(&mut *tx, record.id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        tx.commit().await?;

        info!(
            source = %source,
            account_id = %entry.account_id,
            ledger_entry_id = %ledger_entry.id,
            issued = %entry.issued_net,
            holding = %entry.holding_net,
            "Applied guarded increment"
        );
        Ok(IncrementOutcome {
            record,
            ledger_entry,
            applied: true,
        })
    }
}
