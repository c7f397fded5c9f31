//! Externally delivered events that have already been applied.

use crate::domain::Timestamp;
use serde::{Deserialize, Serialize};

/// One row per external event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedExternalEvent {
    pub id: i64,
    /// Processor-assigned event id; unique.
    pub event_id: String,
    /// Event type as delivered (e.g. "charge.dispute.created").
    pub kind: String,
    /// Originating account scope (e.g. a connected sub-account), if any.
    pub scope: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: Timestamp,
}

/// Result of marking an event processed.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkProcessed {
    /// The canonical row, whoever created it.
    pub event: ProcessedExternalEvent,
    /// True only for the caller whose insert created the row.
    pub created: bool,
}
