use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::domain::{
    AuditLogEntry, AuditOperation, AuditQuery, AuditSourceType, BalanceId, SourceRef, Timestamp,
};
use crate::error::AppError;

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogsQuery {
    pub balance_id: Option<i64>,
    pub operation: Option<String>,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub from_us: Option<i64>,
    pub to_us: Option<i64>,
    pub limit: Option<u32>,
}

impl AuditLogsQuery {
    /// Map the parameters onto exactly one supported read shape.
    pub fn to_audit_query(&self) -> Result<AuditQuery, AppError> {
        let range = match (self.from_us, self.to_us) {
            (Some(from), Some(to)) if from <= to => {
                Some((Timestamp::from_micros(from), Timestamp::from_micros(to)))
            }
            (Some(_), Some(_)) => {
                return Err(AppError::BadRequest("fromUs must not be after toUs".to_string()))
            }
            (None, None) => None,
            _ => {
                return Err(AppError::BadRequest(
                    "fromUs and toUs must be given together".to_string(),
                ))
            }
        };
        let source = match (&self.source_type, &self.source_id) {
            (Some(t), Some(id)) => {
                let source_type = t
                    .parse::<AuditSourceType>()
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                Some(SourceRef::new(source_type, id.clone()))
            }
            (None, None) => None,
            _ => {
                return Err(AppError::BadRequest(
                    "sourceType and sourceId must be given together".to_string(),
                ))
            }
        };

        match (self.balance_id, &self.operation, source, range) {
            (Some(balance_id), None, None, None) => {
                Ok(AuditQuery::ByBalance(BalanceId::new(balance_id)))
            }
            (None, Some(op), None, Some((from, to))) => {
                let operation = op
                    .parse::<AuditOperation>()
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                Ok(AuditQuery::ByOperation {
                    operation,
                    from,
                    to,
                })
            }
            (None, Some(_), None, None) => Err(AppError::BadRequest(
                "operation queries need fromUs and toUs".to_string(),
            )),
            (None, None, Some(source), None) => Ok(AuditQuery::BySource(source)),
            (None, None, None, Some((from, to))) => Ok(AuditQuery::ByTimeRange { from, to }),
            (None, None, None, None) => Err(AppError::BadRequest(
                "one of balanceId, operation, sourceType/sourceId or fromUs/toUs is required"
                    .to_string(),
            )),
            _ => Err(AppError::BadRequest(
                "query parameters combine more than one lookup".to_string(),
            )),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogDto {
    pub id: i64,
    pub balance_id: Option<i64>,
    pub operation: AuditOperation,
    pub amount_before: Option<i64>,
    pub amount_after: Option<i64>,
    pub holding_before: Option<i64>,
    pub holding_after: Option<i64>,
    pub actor: String,
    pub source_type: Option<AuditSourceType>,
    pub source_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at_us: i64,
}

impl From<AuditLogEntry> for AuditLogDto {
    fn from(entry: AuditLogEntry) -> Self {
        let (source_type, source_id) = match entry.source {
            Some(source) => (Some(source.source_type), Some(source.source_id)),
            None => (None, None),
        };
        Self {
            id: entry.id,
            balance_id: entry.balance_id.map(|b| b.as_i64()),
            operation: entry.operation,
            amount_before: entry.amount_before.map(|c| c.as_i64()),
            amount_after: entry.amount_after.map(|c| c.as_i64()),
            holding_before: entry.holding_before.map(|c| c.as_i64()),
            holding_after: entry.holding_after.map(|c| c.as_i64()),
            actor: entry.actor,
            source_type,
            source_id,
            metadata: entry.metadata,
            created_at_us: entry.created_at.as_micros(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogsResponse {
    pub entries: Vec<AuditLogDto>,
}

pub async fn get_audit_logs(
    State(state): State<AppState>,
    Query(params): Query<AuditLogsQuery>,
) -> Result<Json<AuditLogsResponse>, AppError> {
    let query = params.to_audit_query()?;
    let entries = state.repo.query_audit_logs(&query, params.limit()).await?;

    Ok(Json(AuditLogsResponse {
        entries: entries.into_iter().map(AuditLogDto::from).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> AuditLogsQuery {
        AuditLogsQuery {
            balance_id: None,
            operation: None,
            source_type: None,
            source_id: None,
            from_us: None,
            to_us: None,
            limit: None,
        }
    }

    #[test]
    fn test_balance_lookup() {
        let q = AuditLogsQuery {
            balance_id: Some(4),
            ..params()
        };
        assert_eq!(q.to_audit_query().unwrap(), AuditQuery::ByBalance(BalanceId::new(4)));
        assert_eq!(q.limit(), DEFAULT_LIMIT);
    }

    #[test]
    fn test_operation_needs_range() {
        let q = AuditLogsQuery {
            operation: Some("reconciliation".to_string()),
            ..params()
        };
        assert!(matches!(q.to_audit_query(), Err(AppError::BadRequest(_))));

        let q = AuditLogsQuery {
            operation: Some("reconciliation".to_string()),
            from_us: Some(0),
            to_us: Some(10),
            ..params()
        };
        assert_eq!(
            q.to_audit_query().unwrap(),
            AuditQuery::ByOperation {
                operation: AuditOperation::Reconciliation,
                from: Timestamp::from_micros(0),
                to: Timestamp::from_micros(10),
            }
        );
    }

    #[test]
    fn test_mixed_lookups_rejected() {
        let q = AuditLogsQuery {
            balance_id: Some(1),
            source_type: Some("purchase".to_string()),
            source_id: Some("9".to_string()),
            ..params()
        };
        assert!(matches!(q.to_audit_query(), Err(AppError::BadRequest(_))));
        assert!(matches!(params().to_audit_query(), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_limit_is_clamped() {
        let q = AuditLogsQuery {
            limit: Some(50_000),
            ..params()
        };
        assert_eq!(q.limit(), MAX_LIMIT);
    }
}
