//! Causal sources: the business events that justify a ledger entry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of business event a ledger entry can be linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Purchase,
    Dispute,
    Refund,
    Credit,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Purchase,
        SourceKind::Dispute,
        SourceKind::Refund,
        SourceKind::Credit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Purchase => "purchase",
            SourceKind::Dispute => "dispute",
            SourceKind::Refund => "refund",
            SourceKind::Credit => "credit",
        }
    }

    /// Name of the ledger column that carries a link of this kind.
    pub fn ledger_column(&self) -> &'static str {
        match self {
            SourceKind::Purchase => "purchase_id",
            SourceKind::Dispute => "dispute_id",
            SourceKind::Refund => "refund_id",
            SourceKind::Credit => "credit_id",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("unknown source kind: {0}")]
    UnknownKind(String),
    #[error("ledger entry links more than one causal source: {0:?}")]
    MultipleLinks(Vec<SourceKind>),
}

impl FromStr for SourceKind {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(SourceKind::Purchase),
            "dispute" => Ok(SourceKind::Dispute),
            "refund" => Ok(SourceKind::Refund),
            "credit" => Ok(SourceKind::Credit),
            other => Err(SourceError::UnknownKind(other.to_string())),
        }
    }
}

/// Tagged reference to exactly one causal source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CausalSource {
    pub kind: SourceKind,
    pub id: i64,
}

impl CausalSource {
    pub fn new(kind: SourceKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn purchase(id: i64) -> Self {
        Self::new(SourceKind::Purchase, id)
    }

    pub fn dispute(id: i64) -> Self {
        Self::new(SourceKind::Dispute, id)
    }

    pub fn refund(id: i64) -> Self {
        Self::new(SourceKind::Refund, id)
    }

    pub fn credit(id: i64) -> Self {
        Self::new(SourceKind::Credit, id)
    }

    /// Build from the four nullable link columns of a ledger row.
    ///
    /// Returns `Ok(None)` for an orphan and an error when more than one link is set.
    pub fn from_links(
        purchase_id: Option<i64>,
        dispute_id: Option<i64>,
        refund_id: Option<i64>,
        credit_id: Option<i64>,
    ) -> Result<Option<Self>, SourceError> {
        let links: Vec<CausalSource> = [
            (SourceKind::Purchase, purchase_id),
            (SourceKind::Dispute, dispute_id),
            (SourceKind::Refund, refund_id),
            (SourceKind::Credit, credit_id),
        ]
        .into_iter()
        .filter_map(|(kind, id)| id.map(|id| CausalSource::new(kind, id)))
        .collect();

        match links.as_slice() {
            [] => Ok(None),
            [single] => Ok(Some(*single)),
            many => Err(SourceError::MultipleLinks(
                many.iter().map(|s| s.kind).collect(),
            )),
        }
    }

    /// The value for the link column of `kind`, if this source is of that kind.
    pub fn link_for(source: Option<&CausalSource>, kind: SourceKind) -> Option<i64> {
        source.filter(|s| s.kind == kind).map(|s| s.id)
    }
}

impl fmt::Display for CausalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
