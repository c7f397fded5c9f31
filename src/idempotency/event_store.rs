//! De-duplication store for externally delivered events.

use crate::db::Repository;
use crate::domain::{MarkProcessed, Timestamp};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("Event id must not be empty")]
    EmptyEventId,
}

#[derive(Debug, Clone)]
pub struct EventStore {
    repo: Repository,
}

impl EventStore {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Record `event_id` as processed.
    ///
    /// Concurrent calls for one id leave exactly one row, and every caller
    /// gets that row back; `created` tells the winner apart.
    pub async fn mark_processed(
        &self,
        event_id: &str,
        kind: &str,
        scope: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<MarkProcessed, EventStoreError> {
        if event_id.trim().is_empty() {
            return Err(EventStoreError::EmptyEventId);
        }
        let marked = self
            .repo
            .insert_processed_event(event_id, kind, scope, &metadata, Timestamp::now())
            .await?;
        debug!(
            event_id = %event_id,
            kind = %kind,
            created = marked.created,
            "Marked event processed"
        );
        Ok(marked)
    }

    /// Cheap pre-check before expensive processing. Not a guarantee on its own.
    pub async fn already_processed(&self, event_id: &str) -> Result<bool, EventStoreError> {
        Ok(self.repo.processed_event_exists(event_id).await?)
    }

    /// Delete rows older than `retention_days` relative to now.
    ///
    /// The cutoff saturates, so a very long retention deletes nothing.
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64, EventStoreError> {
        let cutoff = Timestamp::now().minus_days(i64::from(retention_days));
        self.cleanup_before(cutoff).await
    }

    /// Delete rows created strictly before `cutoff`. A row at `cutoff` stays.
    pub async fn cleanup_before(&self, cutoff: Timestamp) -> Result<u64, EventStoreError> {
        let removed = self.repo.delete_processed_events_before(cutoff).await?;
        info!(cutoff = %cutoff, removed, "Processed event cleanup");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::test_support::setup_test_db;
    use serde_json::json;

    #[tokio::test]
    async fn test_mark_processed_twice_returns_same_row() {
        let (repo, _temp) = setup_test_db().await;
        let store = EventStore::new(repo.clone());

        let first = store
            .mark_processed("evt_1", "charge.succeeded", Some("acct_1"), json!({"n": 1}))
            .await
            .unwrap();
        let second = store
            .mark_processed("evt_1", "charge.succeeded", Some("acct_1"), json!({"n": 2}))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.event, second.event);
        assert_eq!(second.event.metadata["n"], 1);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_events")
            .fetch_one(repo.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(store.already_processed("evt_1").await.unwrap());
        assert!(!store.already_processed("evt_2").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_with_huge_retention_keeps_everything() {
        let (repo, _temp) = setup_test_db().await;
        repo.insert_processed_event(
            "evt_ancient",
            "charge.succeeded",
            None,
            &json!({}),
            Timestamp::from_micros(0),
        )
        .await
        .unwrap();
        let store = EventStore::new(repo);

        let removed = tokio::spawn(async move { store.cleanup(u32::MAX).await })
            .await
            .expect("cleanup task panicked")
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_empty_event_id_rejected() {
        let (repo, _temp) = setup_test_db().await;
        let store = EventStore::new(repo);
        let result = store.mark_processed("  ", "kind", None, json!({})).await;
        assert!(matches!(result, Err(EventStoreError::EmptyEventId)));
    }
}
