//! Database migrations and initialization.

use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Initialize the SQLite database with schema and pragmas.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).ok();
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .after_connect(|conn, _meta| Box::pin(async move { configure_pragmas_conn(conn).await }))
        .connect(&format!("sqlite:{}?mode=rwc", db_path))
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized successfully at {}", db_path);
    Ok(pool)
}

/// Run all database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    info!("Running database migrations...");
    let schema_sql = include_str!("schema.sql");

    for statement in split_statements(schema_sql) {
        sqlx::query(&statement).execute(pool).await?;
    }

    info!("Migrations completed successfully");
    Ok(())
}

/// Split a schema script into executable statements.
///
/// A plain `;` split would cut trigger bodies apart, so statements inside a
/// `BEGIN ... END;` block are kept together.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_block = false;

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        let upper = trimmed.to_ascii_uppercase();
        if upper == "BEGIN" {
            in_block = true;
        }
        if in_block {
            if upper == "END;" {
                in_block = false;
                statements.push(current.trim().trim_end_matches(';').to_string());
                current.clear();
            }
        } else if trimmed.ends_with(';') {
            statements.push(current.trim().trim_end_matches(';').to_string());
            current.clear();
        }
    }

    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}

/// Per-connection pragmas: foreign keys, WAL, a busy timeout for queued writers.
async fn configure_pragmas_conn(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    use sqlx::Row;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await?;

    // journal_mode returns the actual mode set; must use fetch to get result
    let row = sqlx::query("PRAGMA journal_mode = WAL")
        .fetch_one(&mut *conn)
        .await?;
    let journal_mode: String = row.get(0);
    tracing::debug!(journal_mode = %journal_mode, "SQLite journal mode");

    // Writers queue behind the balance lock instead of failing fast.
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&mut *conn)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fresh_pool() -> (SqlitePool, TempDir, String) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (pool, temp_dir, db_path)
    }

    #[test]
    fn test_split_statements_keeps_trigger_bodies_whole() {
        let sql = "CREATE TABLE a (x INTEGER);\n\
                   -- comment\n\
                   CREATE TRIGGER t BEFORE DELETE ON a\n\
                   BEGIN\n\
                       SELECT RAISE(ABORT, 'no');\n\
                   END;\n\
                   CREATE INDEX i ON a(x);\n";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 3);
        assert!(statements[1].contains("RAISE(ABORT, 'no');"));
        assert!(statements[1].ends_with("END"));
    }

    #[tokio::test]
    async fn test_init_db_creates_database() {
        let (pool, _temp, db_path) = fresh_pool().await;
        assert!(Path::new(&db_path).exists());

        let result: (i64,) = sqlx::query_as("SELECT 1")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        assert_eq!(result.0, 1);
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let (pool, _temp, _) = fresh_pool().await;

        for table in [
            "accounts",
            "balances",
            "ledger_entries",
            "audit_logs",
            "processed_events",
            "increment_records",
        ] {
            let result: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .expect("query failed");
            assert_eq!(result.0, 1, "missing table {}", table);
        }
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let (pool, _temp, _) = fresh_pool().await;

        run_migrations(&pool)
            .await
            .expect("second migration run failed");

        let result: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type='trigger'")
                .fetch_one(&pool)
                .await
                .expect("query failed");
        assert_eq!(result.0, 2);
    }

    #[tokio::test]
    async fn test_audit_rows_reject_update_and_delete() {
        let (pool, _temp, _) = fresh_pool().await;
        sqlx::query(
            "INSERT INTO audit_logs (operation, actor, created_at) VALUES ('increment', 'test', 1)",
        )
        .execute(&pool)
        .await
        .expect("insert failed");

        let update = sqlx::query("UPDATE audit_logs SET actor = 'someone else'")
            .execute(&pool)
            .await;
        assert!(update.is_err());
        let delete = sqlx::query("DELETE FROM audit_logs").execute(&pool).await;
        assert!(delete.is_err());

        let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_logs")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        assert_eq!(result.0, 1);
    }

    #[tokio::test]
    async fn test_pragmas_configured() {
        let (pool, _temp, _) = fresh_pool().await;

        let result: (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        assert_eq!(result.0, 1);

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .expect("query failed");
        // `journal_mode=WAL` is best-effort; SQLite can fall back depending on environment.
        assert!(
            matches!(result.0.as_str(), "wal" | "delete"),
            "unexpected journal_mode: {}",
            result.0
        );
    }
}
