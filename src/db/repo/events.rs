//! Processed external event operations for the repository.

use crate::domain::{MarkProcessed, ProcessedExternalEvent, Timestamp};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{decode_error, json_column, timestamp, Repository};

fn event_from_row(row: &SqliteRow) -> Result<ProcessedExternalEvent, sqlx::Error> {
    Ok(ProcessedExternalEvent {
        id: row.get("id"),
        event_id: row.get("event_id"),
        kind: row.get("kind"),
        scope: row.get("scope"),
        metadata: json_column(row, "metadata")?,
        created_at: timestamp(row, "created_at"),
    })
}

impl Repository {
    /// Insert a processed-event row idempotently and return the canonical row.
    ///
    /// The unique index on `event_id` is the only serialization point: a
    /// losing racer's insert is a no-op and it reads the winner's row.
    pub async fn insert_processed_event(
        &self,
        event_id: &str,
        kind: &str,
        scope: Option<&str>,
        metadata: &serde_json::Value,
        at: Timestamp,
    ) -> Result<MarkProcessed, sqlx::Error> {
        let metadata = serde_json::to_string(metadata).map_err(decode_error)?;
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, kind, scope, metadata, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(kind)
        .bind(scope)
        .bind(metadata)
        .bind(at.as_micros())
        .execute(&self.pool)
        .await?;

        let event = self
            .get_processed_event(event_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        Ok(MarkProcessed {
            event,
            created: result.rows_affected() > 0,
        })
    }

    /// Fetch a processed-event row by external id.
    pub async fn get_processed_event(
        &self,
        event_id: &str,
    ) -> Result<Option<ProcessedExternalEvent>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, event_id, kind, scope, metadata, created_at
            FROM processed_events
            WHERE event_id = ?
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    /// Existence check without decoding the row.
    pub async fn processed_event_exists(&self, event_id: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM processed_events WHERE event_id = ? LIMIT 1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Delete rows created strictly before `cutoff`. Returns the count removed.
    pub async fn delete_processed_events_before(
        &self,
        cutoff: Timestamp,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM processed_events WHERE created_at < ?")
            .bind(cutoff.as_micros())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
