use crate::domain::{AccountId, Cents};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub processor_api_url: Option<String>,
    pub processor_api_key: Option<String>,
    pub operator_account_id: AccountId,
    pub auto_correct_enabled: bool,
    pub auto_correct_max_amount: Option<Cents>,
    pub external_balance_tolerance: Cents,
    pub batch_size: u32,
    pub workers: usize,
    pub progress_every: u64,
    pub alert_rate_threshold: f64,
    pub strict: bool,
    pub reconcile_interval: Duration,
    pub cleanup_interval: Duration,
    pub event_retention_days: u32,
    pub report_dir: Option<PathBuf>,
}

/// Settings the corrector and batch runner need, resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileSettings {
    /// Stamped as the actor of every reconciliation audit entry.
    pub operator_account_id: AccountId,
    pub auto_correct_enabled: bool,
    /// Corrections moving more than this are left for manual review.
    pub auto_correct_max_amount: Option<Cents>,
    pub external_balance_tolerance: Cents,
    pub batch_size: u32,
    pub workers: usize,
    pub progress_every: u64,
    pub alert_rate_threshold: f64,
    pub strict: bool,
    pub report_dir: Option<PathBuf>,
}

impl ReconcileSettings {
    /// Actor string written to audit entries.
    pub fn actor(&self) -> String {
        format!("operator:{}", self.operator_account_id)
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            operator_account_id: AccountId::new(0),
            auto_correct_enabled: false,
            auto_correct_max_amount: None,
            external_balance_tolerance: Cents::ZERO,
            batch_size: 500,
            workers: 4,
            progress_every: 1000,
            alert_rate_threshold: 0.01,
            strict: false,
            report_dir: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: &str,
    expected: &str,
) -> Result<T, ConfigError> {
    env_map
        .get(key)
        .map(|s| s.as_str())
        .unwrap_or(default)
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), format!("must be {}", expected)))
}

fn parse_optional<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    expected: &str,
) -> Result<Option<T>, ConfigError> {
    match env_map.get(key).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            ConfigError::InvalidValue(key.to_string(), format!("must be {}", expected))
        }),
        None => Ok(None),
    }
}

fn parse_bool(env_map: &HashMap<String, String>, key: &str) -> Result<bool, ConfigError> {
    match env_map
        .get(key)
        .map(|s| s.trim().to_ascii_lowercase())
        .as_deref()
    {
        None | Some("") | Some("false") | Some("0") | Some("no") => Ok(false),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some(other) => Err(ConfigError::InvalidValue(
            key.to_string(),
            format!("must be true or false, got {}", other),
        )),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or::<u16>(&env_map, "PORT", "8080", "a valid u16")?;

        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let processor_api_url = env_map
            .get("PROCESSOR_API_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let processor_api_key = env_map
            .get("PROCESSOR_API_KEY")
            .cloned()
            .filter(|s| !s.is_empty());

        let operator_account_id = env_map
            .get("OPERATOR_ACCOUNT_ID")
            .ok_or_else(|| ConfigError::MissingEnv("OPERATOR_ACCOUNT_ID".to_string()))?
            .trim()
            .parse::<i64>()
            .map(AccountId::new)
            .map_err(|_| {
                ConfigError::InvalidValue(
                    "OPERATOR_ACCOUNT_ID".to_string(),
                    "must be a valid i64".to_string(),
                )
            })?;

        let auto_correct_enabled = parse_bool(&env_map, "AUTO_CORRECT_ENABLED")?;
        let auto_correct_max_amount =
            parse_optional::<i64>(&env_map, "AUTO_CORRECT_MAX_AMOUNT_CENTS", "a valid i64")?
                .map(Cents::new);
        if matches!(auto_correct_max_amount, Some(max) if max < Cents::ZERO) {
            return Err(ConfigError::InvalidValue(
                "AUTO_CORRECT_MAX_AMOUNT_CENTS".to_string(),
                "must not be negative".to_string(),
            ));
        }

        let external_balance_tolerance = Cents::new(parse_or::<i64>(
            &env_map,
            "EXTERNAL_BALANCE_TOLERANCE_CENTS",
            "0",
            "a valid i64",
        )?);
        if external_balance_tolerance < Cents::ZERO {
            return Err(ConfigError::InvalidValue(
                "EXTERNAL_BALANCE_TOLERANCE_CENTS".to_string(),
                "must not be negative".to_string(),
            ));
        }

        let batch_size = parse_or::<u32>(&env_map, "RECONCILE_BATCH_SIZE", "500", "a valid u32")?;
        let workers = parse_or::<usize>(&env_map, "RECONCILE_WORKERS", "4", "a valid usize")?;
        if batch_size == 0 || workers == 0 {
            return Err(ConfigError::InvalidValue(
                if batch_size == 0 {
                    "RECONCILE_BATCH_SIZE"
                } else {
                    "RECONCILE_WORKERS"
                }
                .to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        let progress_every =
            parse_or::<u64>(&env_map, "RECONCILE_PROGRESS_EVERY", "1000", "a valid u64")?;

        let alert_rate_threshold = parse_or::<f64>(
            &env_map,
            "ALERT_DISCREPANCY_RATE_THRESHOLD",
            "0.01",
            "a number",
        )?;
        if !(0.0..=1.0).contains(&alert_rate_threshold) {
            return Err(ConfigError::InvalidValue(
                "ALERT_DISCREPANCY_RATE_THRESHOLD".to_string(),
                "must be between 0 and 1".to_string(),
            ));
        }

        let strict = parse_bool(&env_map, "RECONCILE_STRICT")?;
        let reconcile_interval = Duration::from_secs(parse_or::<u64>(
            &env_map,
            "RECONCILE_INTERVAL_SECS",
            "86400",
            "a valid u64",
        )?);
        let cleanup_interval = Duration::from_secs(parse_or::<u64>(
            &env_map,
            "CLEANUP_INTERVAL_SECS",
            "86400",
            "a valid u64",
        )?);
        for (key, interval) in [
            ("RECONCILE_INTERVAL_SECS", reconcile_interval),
            ("CLEANUP_INTERVAL_SECS", cleanup_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue(
                    key.to_string(),
                    "must be greater than zero".to_string(),
                ));
            }
        }
        let event_retention_days =
            parse_or::<u32>(&env_map, "EVENT_RETENTION_DAYS", "30", "a valid u32")?;

        let report_dir = env_map
            .get("REPORT_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Config {
            port,
            database_path,
            processor_api_url,
            processor_api_key,
            operator_account_id,
            auto_correct_enabled,
            auto_correct_max_amount,
            external_balance_tolerance,
            batch_size,
            workers,
            progress_every,
            alert_rate_threshold,
            strict,
            reconcile_interval,
            cleanup_interval,
            event_retention_days,
            report_dir,
        })
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            operator_account_id: self.operator_account_id,
            auto_correct_enabled: self.auto_correct_enabled,
            auto_correct_max_amount: self.auto_correct_max_amount,
            external_balance_tolerance: self.external_balance_tolerance,
            batch_size: self.batch_size,
            workers: self.workers,
            progress_every: self.progress_every,
            alert_rate_threshold: self.alert_rate_threshold,
            strict: self.strict,
            report_dir: self.report_dir.clone(),
        }
    }
}
