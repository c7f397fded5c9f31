//! Outbound notification seams: operator alerts and account case notes.

use crate::domain::AccountId;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tracing::{info, warn};

/// A structured alert for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub title: String,
    /// None for fleet-wide alerts.
    pub account_id: Option<AccountId>,
    pub payload: serde_json::Value,
}

impl Alert {
    pub fn new(title: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            title: title.into(),
            account_id: None,
            payload,
        }
    }

    pub fn for_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }
}

/// A human-readable note attached to an account for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseNote {
    pub account_id: AccountId,
    pub note: String,
}

/// Receives per-account discrepancy reports and fleet-wide alerts.
#[async_trait]
pub trait AlertSink: Send + Sync + fmt::Debug {
    async fn send(&self, alert: Alert);
}

/// Receives manual-review notes (orphans, skipped corrections).
#[async_trait]
pub trait CaseNoteSink: Send + Sync + fmt::Debug {
    async fn add_note(&self, note: CaseNote);
}

/// Sink that writes alerts and notes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl AlertSink for TracingSink {
    async fn send(&self, alert: Alert) {
        warn!(
            title = %alert.title,
            account_id = ?alert.account_id.map(|a| a.as_i64()),
            payload = %alert.payload,
            "Alert"
        );
    }
}

#[async_trait]
impl CaseNoteSink for TracingSink {
    async fn add_note(&self, note: CaseNote) {
        info!(account_id = %note.account_id, note = %note.note, "Case note");
    }
}

/// Sink that keeps everything it receives in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
    notes: Mutex<Vec<CaseNote>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        match self.alerts.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn notes(&self) -> Vec<CaseNote> {
        match self.notes.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn send(&self, alert: Alert) {
        match self.alerts.lock() {
            Ok(mut guard) => guard.push(alert),
            Err(poisoned) => poisoned.into_inner().push(alert),
        }
    }
}

#[async_trait]
impl CaseNoteSink for RecordingSink {
    async fn add_note(&self, note: CaseNote) {
        match self.notes.lock() {
            Ok(mut guard) => guard.push(note),
            Err(poisoned) => poisoned.into_inner().push(note),
        }
    }
}
