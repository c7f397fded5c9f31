//! Ledger entry operations for the repository.

use crate::domain::{
    AccountId, AuditOperation, BalanceId, CausalSource, Cents, LedgerEntry, LedgerEntryId,
    NewAuditLogEntry, NewLedgerEntry, SourceKind, Timestamp,
};
use serde_json::json;
use sqlx::sqlite::SqliteConnection;

use super::{ledger_entry_from_row, Repository, LEDGER_COLUMNS};

impl Repository {
    /// Write a ledger entry against the account's balance.
    ///
    /// Only the ledger is touched; the cached balance is left alone.
    ///
    /// # Errors
    /// Returns `RowNotFound` if the account has no balance row.
    pub async fn insert_ledger_entry(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let balance_id = Self::balance_id_for_account(&mut *tx, entry.account_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        let inserted = Self::insert_ledger_entry_conn(&mut *tx, &entry, balance_id).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Insert a ledger entry inside a caller-owned transaction.
    pub async fn insert_ledger_entry_conn(
        conn: &mut SqliteConnection,
        entry: &NewLedgerEntry,
        balance_id: BalanceId,
    ) -> Result<LedgerEntry, sqlx::Error> {
        let source = entry.source.as_ref();
        let id = sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                account_id, balance_id, purchase_id, dispute_id, refund_id, credit_id,
                issued_net, holding_net, currency, merchant_account_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.account_id.as_i64())
        .bind(balance_id.as_i64())
        .bind(CausalSource::link_for(source, SourceKind::Purchase))
        .bind(CausalSource::link_for(source, SourceKind::Dispute))
        .bind(CausalSource::link_for(source, SourceKind::Refund))
        .bind(CausalSource::link_for(source, SourceKind::Credit))
        .bind(entry.issued_net.as_i64())
        .bind(entry.holding_net.as_i64())
        .bind(entry.currency.as_str())
        .bind(entry.merchant_account_id.as_deref())
        .bind(entry.created_at.as_micros())
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        Ok(LedgerEntry {
            id: LedgerEntryId::new(id),
            account_id: entry.account_id,
            balance_id,
            source: entry.source,
            issued_net: entry.issued_net,
            holding_net: entry.holding_net,
            currency: entry.currency.clone(),
            merchant_account_id: entry.merchant_account_id.clone(),
            payout_id: None,
            created_at: entry.created_at,
            deleted_at: None,
        })
    }

    /// Fetch a ledger entry by id, deleted or not.
    pub async fn get_ledger_entry(
        &self,
        id: LedgerEntryId,
    ) -> Result<Option<LedgerEntry>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        Self::get_ledger_entry_conn(&mut *conn, id).await
    }

    pub async fn get_ledger_entry_conn(
        conn: &mut SqliteConnection,
        id: LedgerEntryId,
    ) -> Result<Option<LedgerEntry>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE id = ?",
            LEDGER_COLUMNS
        ))
        .bind(id.as_i64())
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(ledger_entry_from_row).transpose()
    }

    /// All ledger entries of an account, including deleted and paid ones.
    pub async fn ledger_entries_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE account_id = ? ORDER BY created_at ASC, id ASC",
            LEDGER_COLUMNS
        ))
        .bind(account_id.as_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_entry_from_row).collect()
    }

    /// Non-deleted entries, paid or not, oldest first.
    pub async fn live_entries(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM ledger_entries
            WHERE account_id = ? AND deleted_at IS NULL
            ORDER BY created_at ASC, id ASC
            "#,
            LEDGER_COLUMNS
        ))
        .bind(account_id.as_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_entry_from_row).collect()
    }

    /// Non-deleted entries not yet swept into a payout, oldest first.
    pub async fn live_unpaid_entries_conn(
        conn: &mut SqliteConnection,
        account_id: AccountId,
    ) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM ledger_entries
            WHERE account_id = ? AND deleted_at IS NULL AND payout_id IS NULL
            ORDER BY created_at ASC, id ASC
            "#,
            LEDGER_COLUMNS
        ))
        .bind(account_id.as_i64())
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(ledger_entry_from_row).collect()
    }

    /// Non-deleted entries linked to one causal source, oldest first.
    pub async fn live_entries_for_source(
        &self,
        source: CausalSource,
    ) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM ledger_entries
            WHERE {} = ? AND deleted_at IS NULL
            ORDER BY created_at ASC, id ASC
            "#,
            LEDGER_COLUMNS,
            source.kind.ledger_column()
        ))
        .bind(source.id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_entry_from_row).collect()
    }

    /// Set the deletion marker on a live entry.
    ///
    /// Returns false when the entry was already deleted (or does not exist),
    /// which correctors treat as "already fixed".
    pub async fn soft_delete_ledger_entry(
        conn: &mut SqliteConnection,
        id: LedgerEntryId,
        at: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE ledger_entries SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(at.as_micros())
        .bind(id.as_i64())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Sweep every live unpaid entry of an account into a payout.
    ///
    /// The swept sums leave the cached balance in the same transaction and a
    /// `transfer_out` audit entry records the movement. Returns the number of
    /// entries swept.
    pub async fn record_payout(
        &self,
        account_id: AccountId,
        payout_id: i64,
        actor: &str,
    ) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let balance = Self::lock_account_balance(&mut *tx, account_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        let balance_id = balance.id;

        let swept = Self::live_unpaid_entries_conn(&mut *tx, account_id).await?;
        if swept.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }
        let issued: Cents = swept.iter().map(|e| e.issued_net).sum();
        let holding: Cents = swept.iter().map(|e| e.holding_net).sum();

        let result = sqlx::query(
            r#"
            UPDATE ledger_entries SET payout_id = ?
            WHERE account_id = ? AND deleted_at IS NULL AND payout_id IS NULL
            "#,
        )
        .bind(payout_id)
        .bind(account_id.as_i64())
        .execute(&mut *tx)
        .await?;

        let now = Timestamp::now();
        let amount_after = balance.amount - issued;
        let holding_after = balance.holding_amount - holding;
        Self::write_balance_amounts(&mut *tx, balance_id, amount_after, holding_after, now).await?;
        Self::insert_audit_log(
            &mut *tx,
            &NewAuditLogEntry::new(AuditOperation::TransferOut, actor)
                .balance(balance_id)
                .amount(balance.amount, amount_after)
                .holding(balance.holding_amount, holding_after)
                .metadata(json!({
                    "payout_id": payout_id,
                    "entries": result.rows_affected(),
                })),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }
}
