//! Domain primitives: Timestamp, AccountId, BalanceId, LedgerEntryId, Currency.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Time in microseconds since Unix epoch (UTC).
///
/// Microsecond resolution is what the retention sweep compares against, so
/// every persisted timestamp goes through this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Create a Timestamp from microseconds.
    pub fn from_micros(us: i64) -> Self {
        Timestamp(us)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_micros())
    }

    /// Get the underlying microseconds value.
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// Convert to a chrono datetime, clamping unrepresentable values to the epoch.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_micros(self.0).unwrap_or_default()
    }

    /// Last representable microsecond of the given UTC calendar date.
    pub fn end_of_day(date: NaiveDate) -> Self {
        let next = date.succ_opt().unwrap_or(date);
        let midnight = next.and_hms_opt(0, 0, 0).unwrap_or_default();
        Timestamp(Utc.from_utc_datetime(&midnight).timestamp_micros() - 1)
    }

    /// Shift backwards by a whole number of days.
    pub fn minus_days(&self, days: i64) -> Self {
        Timestamp(self.0.saturating_sub(days.saturating_mul(86_400_000_000)))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Timestamp(value.timestamp_micros())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn new(id: i64) -> Self {
                $name(id)
            }

            pub fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Seller account identifier.
    AccountId
);
row_id!(
    /// Cached balance row identifier.
    BalanceId
);
row_id!(
    /// Ledger entry ("balance transaction") identifier.
    LedgerEntryId
);

/// ISO-4217 currency code, lowercased (e.g. "usd").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(pub String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Currency(code.into().trim().to_lowercase())
    }

    pub fn usd() -> Self {
        Currency("usd".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
