//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by store:
//! - `accounts.rs` - Accounts and cached balances, including the balance lock
//! - `ledger.rs` - Ledger entries, soft-delete and payouts
//! - `audit.rs` - Append-only audit trail and its read shapes
//! - `events.rs` - Processed external events
//! - `increments.rs` - Per-source increment records
//!
//! Methods that take a `&mut SqliteConnection` are meant to run inside a
//! caller-owned transaction; the rest use the pool directly.

mod accounts;
mod audit;
mod events;
mod increments;
mod ledger;

use crate::domain::{
    AccountId, BalanceId, CausalSource, Cents, Currency, LedgerEntry, LedgerEntryId, Timestamp,
};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    /// Underlying pool, for callers that own a transaction.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn decode_error<E>(err: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(err))
}

fn timestamp(row: &SqliteRow, column: &str) -> Timestamp {
    Timestamp::from_micros(row.get::<i64, _>(column))
}

fn optional_timestamp(row: &SqliteRow, column: &str) -> Option<Timestamp> {
    row.get::<Option<i64>, _>(column).map(Timestamp::from_micros)
}

fn json_column(row: &SqliteRow, column: &str) -> Result<serde_json::Value, sqlx::Error> {
    let raw: String = row.get(column);
    serde_json::from_str(&raw).map_err(decode_error)
}

pub(crate) const LEDGER_COLUMNS: &str = "id, account_id, balance_id, purchase_id, dispute_id, \
     refund_id, credit_id, issued_net, holding_net, currency, merchant_account_id, payout_id, \
     created_at, deleted_at";

fn ledger_entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, sqlx::Error> {
    let source = CausalSource::from_links(
        row.get("purchase_id"),
        row.get("dispute_id"),
        row.get("refund_id"),
        row.get("credit_id"),
    )
    .map_err(decode_error)?;

    Ok(LedgerEntry {
        id: LedgerEntryId::new(row.get("id")),
        account_id: AccountId::new(row.get("account_id")),
        balance_id: BalanceId::new(row.get("balance_id")),
        source,
        issued_net: Cents::new(row.get("issued_net")),
        holding_net: Cents::new(row.get("holding_net")),
        currency: Currency::new(row.get::<String, _>("currency")),
        merchant_account_id: row.get("merchant_account_id"),
        payout_id: row.get("payout_id"),
        created_at: timestamp(row, "created_at"),
        deleted_at: optional_timestamp(row, "deleted_at"),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Repository;
    use crate::db::migrations::init_db;
    use tempfile::TempDir;

    pub async fn setup_test_db() -> (Repository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (Repository::new(pool), temp_dir)
    }
}
