//! Account and cached-balance operations for the repository.

use crate::domain::{Account, AccountId, Balance, BalanceId, Cents, Currency, Timestamp};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::{timestamp, Repository};

const BALANCE_COLUMNS: &str = "id, account_id, currency, amount, holding_amount, updated_at";

fn account_from_row(row: &SqliteRow) -> Account {
    Account {
        id: AccountId::new(row.get("id")),
        merchant_account_id: row.get("merchant_account_id"),
        created_at: timestamp(row, "created_at"),
    }
}

fn balance_from_row(row: &SqliteRow) -> Balance {
    Balance {
        id: BalanceId::new(row.get("id")),
        account_id: AccountId::new(row.get("account_id")),
        currency: Currency::new(row.get::<String, _>("currency")),
        amount: Cents::new(row.get("amount")),
        holding_amount: Cents::new(row.get("holding_amount")),
        updated_at: timestamp(row, "updated_at"),
    }
}

impl Repository {
    /// Create an account together with its zeroed balance row.
    ///
    /// # Errors
    /// Returns an error if either insert fails.
    pub async fn create_account(
        &self,
        merchant_account_id: Option<&str>,
        currency: &Currency,
        created_at: Timestamp,
    ) -> Result<(Account, Balance), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let account_id = sqlx::query(
            "INSERT INTO accounts (merchant_account_id, created_at) VALUES (?, ?)",
        )
        .bind(merchant_account_id)
        .bind(created_at.as_micros())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let balance_id = sqlx::query(
            r#"
            INSERT INTO balances (account_id, currency, amount, holding_amount, updated_at)
            VALUES (?, ?, 0, 0, ?)
            "#,
        )
        .bind(account_id)
        .bind(currency.as_str())
        .bind(created_at.as_micros())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;

        Ok((
            Account {
                id: AccountId::new(account_id),
                merchant_account_id: merchant_account_id.map(str::to_string),
                created_at,
            },
            Balance {
                id: BalanceId::new(balance_id),
                account_id: AccountId::new(account_id),
                currency: currency.clone(),
                amount: Cents::ZERO,
                holding_amount: Cents::ZERO,
                updated_at: created_at,
            },
        ))
    }

    /// Fetch an account by id.
    pub async fn get_account(&self, id: AccountId) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query("SELECT id, merchant_account_id, created_at FROM accounts WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(account_from_row))
    }

    /// Fetch the cached balance for an account.
    pub async fn get_balance_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Option<Balance>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM balances WHERE account_id = ?",
            BALANCE_COLUMNS
        ))
        .bind(account_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(balance_from_row))
    }

    /// Fetch a cached balance by id.
    pub async fn get_balance(&self, id: BalanceId) -> Result<Option<Balance>, sqlx::Error> {
        let row = sqlx::query(&format!("SELECT {} FROM balances WHERE id = ?", BALANCE_COLUMNS))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(balance_from_row))
    }

    /// Next page of accounts worth reconciling, in ascending id order.
    ///
    /// An account qualifies when its cached balance is nonzero or it has ever
    /// had a ledger entry. Paging is keyset-based on `after`, so a run can
    /// resume from the last id it finished.
    pub async fn list_active_accounts(
        &self,
        after: Option<AccountId>,
        created_on_or_before: Timestamp,
        limit: u32,
    ) -> Result<Vec<Account>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.merchant_account_id, a.created_at
            FROM accounts a
            LEFT JOIN balances b ON b.account_id = a.id
            WHERE a.id > ?
              AND a.created_at <= ?
              AND (
                  COALESCE(b.amount, 0) != 0
                  OR COALESCE(b.holding_amount, 0) != 0
                  OR EXISTS (SELECT 1 FROM ledger_entries le WHERE le.account_id = a.id)
              )
            ORDER BY a.id ASC
            LIMIT ?
            "#,
        )
        .bind(after.map(|a| a.as_i64()).unwrap_or(i64::MIN))
        .bind(created_on_or_before.as_micros())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(account_from_row).collect())
    }

    /// Overwrite both cached figures outside any audit path.
    ///
    /// This is the settlement collaborators' raw writer; reconciliation never
    /// calls it.
    pub async fn set_balance_amounts(
        &self,
        id: BalanceId,
        amount: Cents,
        holding_amount: Cents,
    ) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        Self::write_balance_amounts(&mut *conn, id, amount, holding_amount, Timestamp::now()).await
    }

    /// Take the write lock on a balance row and read it.
    ///
    /// The dummy update comes first so the transaction holds SQLite's write
    /// lock before anything is read; concurrent correctors queue on
    /// `busy_timeout` instead of racing on a stale read.
    pub async fn lock_balance(
        conn: &mut SqliteConnection,
        id: BalanceId,
    ) -> Result<Option<Balance>, sqlx::Error> {
        let locked = sqlx::query("UPDATE balances SET updated_at = updated_at WHERE id = ?")
            .bind(id.as_i64())
            .execute(&mut *conn)
            .await?;
        if locked.rows_affected() == 0 {
            return Ok(None);
        }

        let row = sqlx::query(&format!("SELECT {} FROM balances WHERE id = ?", BALANCE_COLUMNS))
            .bind(id.as_i64())
            .fetch_one(&mut *conn)
            .await?;
        Ok(Some(balance_from_row(&row)))
    }

    /// Same as [`Repository::lock_balance`], addressed by owning account.
    pub async fn lock_account_balance(
        conn: &mut SqliteConnection,
        account_id: AccountId,
    ) -> Result<Option<Balance>, sqlx::Error> {
        let locked = sqlx::query("UPDATE balances SET updated_at = updated_at WHERE account_id = ?")
            .bind(account_id.as_i64())
            .execute(&mut *conn)
            .await?;
        if locked.rows_affected() == 0 {
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM balances WHERE account_id = ?",
            BALANCE_COLUMNS
        ))
        .bind(account_id.as_i64())
        .fetch_one(&mut *conn)
        .await?;
        Ok(Some(balance_from_row(&row)))
    }

    /// Write both cached figures. Callers hold the balance lock.
    pub async fn write_balance_amounts(
        conn: &mut SqliteConnection,
        id: BalanceId,
        amount: Cents,
        holding_amount: Cents,
        at: Timestamp,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE balances SET amount = ?, holding_amount = ?, updated_at = ? WHERE id = ?",
        )
        .bind(amount.as_i64())
        .bind(holding_amount.as_i64())
        .bind(at.as_micros())
        .bind(id.as_i64())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Balance id for an account, inside a transaction.
    pub async fn balance_id_for_account(
        conn: &mut SqliteConnection,
        account_id: AccountId,
    ) -> Result<Option<BalanceId>, sqlx::Error> {
        let row = sqlx::query("SELECT id FROM balances WHERE account_id = ?")
            .bind(account_id.as_i64())
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(|r| BalanceId::new(r.get("id"))))
    }
}

#[cfg(test)]
mod tests {
    use crate::db::repo::test_support::setup_test_db;
    use crate::domain::{AccountId, CausalSource, Cents, Currency, NewLedgerEntry, Timestamp};

    #[tokio::test]
    async fn test_create_account_creates_zero_balance() {
        let (repo, _temp) = setup_test_db().await;

        let (account, balance) = repo
            .create_account(Some("acct_1"), &Currency::usd(), Timestamp::from_micros(10))
            .await
            .unwrap();

        let stored = repo.get_balance_for_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored, balance);
        assert_eq!(stored.amount, Cents::ZERO);
        assert_eq!(
            repo.get_account(account.id).await.unwrap().unwrap().merchant_account_id,
            Some("acct_1".to_string())
        );
    }

    #[tokio::test]
    async fn test_list_active_accounts_pages_by_id() {
        let (repo, _temp) = setup_test_db().await;
        let now = Timestamp::from_micros(1_000);

        let (idle, _) = repo.create_account(None, &Currency::usd(), now).await.unwrap();
        let (with_balance, b) = repo.create_account(None, &Currency::usd(), now).await.unwrap();
        let (with_entry, _) = repo.create_account(None, &Currency::usd(), now).await.unwrap();
        let (late, late_balance) = repo
            .create_account(None, &Currency::usd(), Timestamp::from_micros(5_000))
            .await
            .unwrap();

        repo.set_balance_amounts(b.id, Cents(100), Cents::ZERO).await.unwrap();
        repo.set_balance_amounts(late_balance.id, Cents(100), Cents::ZERO)
            .await
            .unwrap();
        repo.insert_ledger_entry(NewLedgerEntry::new(
            with_entry.id,
            Some(CausalSource::purchase(1)),
            Cents::ZERO,
            Cents::ZERO,
        ))
        .await
        .unwrap();

        let first = repo.list_active_accounts(None, now, 1).await.unwrap();
        assert_eq!(first.iter().map(|a| a.id).collect::<Vec<_>>(), vec![with_balance.id]);

        let rest = repo
            .list_active_accounts(Some(first[0].id), now, 10)
            .await
            .unwrap();
        assert_eq!(rest.iter().map(|a| a.id).collect::<Vec<_>>(), vec![with_entry.id]);

        let all = repo
            .list_active_accounts(None, Timestamp::from_micros(i64::MAX), 10)
            .await
            .unwrap();
        assert!(all.iter().all(|a| a.id != idle.id));
        assert!(all.iter().any(|a| a.id == late.id));
        assert!(repo.get_account(AccountId::new(999)).await.unwrap().is_none());
    }
}
