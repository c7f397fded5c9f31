//! Audit trail operations for the repository.
//!
//! Rows are only ever inserted. There is deliberately no update or delete
//! here, and the schema's triggers reject both at the storage level too.

use crate::domain::{
    AuditLogEntry, AuditOperation, AuditQuery, AuditSourceType, BalanceId, Cents,
    NewAuditLogEntry, SourceRef, Timestamp,
};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::{decode_error, json_column, timestamp, Repository};

const AUDIT_COLUMNS: &str = "id, balance_id, operation, amount_before, amount_after, \
     holding_before, holding_after, actor, source_type, source_id, metadata, created_at";

fn audit_entry_from_row(row: &SqliteRow) -> Result<AuditLogEntry, sqlx::Error> {
    let operation: String = row.get("operation");
    let source_type: Option<String> = row.get("source_type");
    let source_id: Option<String> = row.get("source_id");
    let source = match (source_type, source_id) {
        (Some(t), Some(id)) => Some(SourceRef::new(
            t.parse::<AuditSourceType>().map_err(decode_error)?,
            id,
        )),
        _ => None,
    };

    Ok(AuditLogEntry {
        id: row.get("id"),
        balance_id: row.get::<Option<i64>, _>("balance_id").map(BalanceId::new),
        operation: operation.parse::<AuditOperation>().map_err(decode_error)?,
        amount_before: row.get::<Option<i64>, _>("amount_before").map(Cents::new),
        amount_after: row.get::<Option<i64>, _>("amount_after").map(Cents::new),
        holding_before: row.get::<Option<i64>, _>("holding_before").map(Cents::new),
        holding_after: row.get::<Option<i64>, _>("holding_after").map(Cents::new),
        actor: row.get("actor"),
        source,
        metadata: json_column(row, "metadata")?,
        created_at: timestamp(row, "created_at"),
    })
}

impl Repository {
    /// Append an audit row inside a caller-owned transaction.
    pub async fn insert_audit_log(
        conn: &mut SqliteConnection,
        entry: &NewAuditLogEntry,
        at: Timestamp,
    ) -> Result<AuditLogEntry, sqlx::Error> {
        let metadata = serde_json::to_string(&entry.metadata).map_err(decode_error)?;
        let id = sqlx::query(
            r#"
            INSERT INTO audit_logs (
                balance_id, operation, amount_before, amount_after, holding_before,
                holding_after, actor, source_type, source_id, metadata, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.balance_id.map(|b| b.as_i64()))
        .bind(entry.operation.as_str())
        .bind(entry.amount.map(|c| c.before.as_i64()))
        .bind(entry.amount.map(|c| c.after.as_i64()))
        .bind(entry.holding.map(|c| c.before.as_i64()))
        .bind(entry.holding.map(|c| c.after.as_i64()))
        .bind(&entry.actor)
        .bind(entry.source.as_ref().map(|s| s.source_type.as_str()))
        .bind(entry.source.as_ref().map(|s| s.source_id.as_str()))
        .bind(metadata)
        .bind(at.as_micros())
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        Ok(AuditLogEntry {
            id,
            balance_id: entry.balance_id,
            operation: entry.operation,
            amount_before: entry.amount.map(|c| c.before),
            amount_after: entry.amount.map(|c| c.after),
            holding_before: entry.holding.map(|c| c.before),
            holding_after: entry.holding.map(|c| c.after),
            actor: entry.actor.clone(),
            source: entry.source.clone(),
            metadata: entry.metadata.clone(),
            created_at: at,
        })
    }

    /// Append an audit row in its own transaction.
    pub async fn append_audit_log(
        &self,
        entry: &NewAuditLogEntry,
    ) -> Result<AuditLogEntry, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_audit_log(&mut *conn, entry, Timestamp::now()).await
    }

    /// Read audit rows for one of the supported query shapes, oldest first.
    ///
    /// Time ranges are inclusive on both ends.
    pub async fn query_audit_logs(
        &self,
        query: &AuditQuery,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, sqlx::Error> {
        let limit = i64::from(limit);
        let rows = match query {
            AuditQuery::ByBalance(balance_id) => {
                sqlx::query(&format!(
                    "SELECT {} FROM audit_logs WHERE balance_id = ? \
                     ORDER BY created_at ASC, id ASC LIMIT ?",
                    AUDIT_COLUMNS
                ))
                .bind(balance_id.as_i64())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            AuditQuery::ByOperation {
                operation,
                from,
                to,
            } => {
                sqlx::query(&format!(
                    "SELECT {} FROM audit_logs \
                     WHERE operation = ? AND created_at >= ? AND created_at <= ? \
                     ORDER BY created_at ASC, id ASC LIMIT ?",
                    AUDIT_COLUMNS
                ))
                .bind(operation.as_str())
                .bind(from.as_micros())
                .bind(to.as_micros())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            AuditQuery::BySource(source) => {
                sqlx::query(&format!(
                    "SELECT {} FROM audit_logs WHERE source_type = ? AND source_id = ? \
                     ORDER BY created_at ASC, id ASC LIMIT ?",
                    AUDIT_COLUMNS
                ))
                .bind(source.source_type.as_str())
                .bind(&source.source_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            AuditQuery::ByTimeRange { from, to } => {
                sqlx::query(&format!(
                    "SELECT {} FROM audit_logs WHERE created_at >= ? AND created_at <= ? \
                     ORDER BY created_at ASC, id ASC LIMIT ?",
                    AUDIT_COLUMNS
                ))
                .bind(from.as_micros())
                .bind(to.as_micros())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(audit_entry_from_row).collect()
    }
}
