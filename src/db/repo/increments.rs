//! Increment record operations for the repository.

use crate::domain::{CausalSource, IdempotentIncrementRecord, LedgerEntryId, SourceKind, Timestamp};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::{decode_error, optional_timestamp, timestamp, Repository};

fn record_from_row(row: &SqliteRow) -> Result<IdempotentIncrementRecord, sqlx::Error> {
    let kind: String = row.get("source_kind");
    Ok(IdempotentIncrementRecord {
        id: row.get("id"),
        source: CausalSource::new(
            kind.parse::<SourceKind>().map_err(decode_error)?,
            row.get("source_id"),
        ),
        ledger_entry_id: row
            .get::<Option<i64>, _>("ledger_entry_id")
            .map(LedgerEntryId::new),
        created_at: timestamp(row, "created_at"),
        completed_at: optional_timestamp(row, "completed_at"),
    })
}

impl Repository {
    /// Create the record for `source` unless one exists, then read it back.
    ///
    /// Returns the canonical record and whether this call created it. As the
    /// first statement of a transaction, the insert also takes the write lock.
    pub async fn upsert_increment_record(
        conn: &mut SqliteConnection,
        source: CausalSource,
        at: Timestamp,
    ) -> Result<(IdempotentIncrementRecord, bool), sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO increment_records (source_kind, source_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source_kind, source_id) DO NOTHING
            "#,
        )
        .bind(source.kind.as_str())
        .bind(source.id)
        .bind(at.as_micros())
        .execute(&mut *conn)
        .await?;

        let record = Self::increment_record_for_source(conn, source)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok((record, result.rows_affected() > 0))
    }

    pub async fn increment_record_for_source(
        conn: &mut SqliteConnection,
        source: CausalSource,
    ) -> Result<Option<IdempotentIncrementRecord>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, source_kind, source_id, ledger_entry_id, created_at, completed_at
            FROM increment_records
            WHERE source_kind = ? AND source_id = ?
            "#,
        )
        .bind(source.kind.as_str())
        .bind(source.id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn increment_record_by_id(
        conn: &mut SqliteConnection,
        id: i64,
    ) -> Result<Option<IdempotentIncrementRecord>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, source_kind, source_id, ledger_entry_id, created_at, completed_at
            FROM increment_records
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Attach the fulfilling ledger entry if the record is still pending.
    ///
    /// Returns false when the record was already completed.
    pub async fn complete_increment_record(
        conn: &mut SqliteConnection,
        id: i64,
        ledger_entry_id: LedgerEntryId,
        at: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE increment_records
            SET ledger_entry_id = ?, completed_at = ?
            WHERE id = ? AND ledger_entry_id IS NULL
            "#,
        )
        .bind(ledger_entry_id.as_i64())
        .bind(at.as_micros())
        .bind(id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
