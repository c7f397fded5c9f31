//! CSV export of a run's discrepancies for operators.

use crate::reconcile::{CorrectionOutcome, RunResult};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    run_id: String,
    as_of: String,
    account_id: i64,
    kind: &'static str,
    fingerprint: String,
    correction: &'static str,
    message: &'a str,
}

/// One row per discrepancy, with the last correction status seen for it.
pub fn write_report<W: Write>(
    writer: W,
    run: &RunResult,
    outcomes: &[CorrectionOutcome],
) -> Result<(), ReportError> {
    let status: HashMap<&str, &'static str> = outcomes
        .iter()
        .map(|o| (o.fingerprint.as_str(), o.status.as_str()))
        .collect();

    let mut csv = csv::Writer::from_writer(writer);
    for discrepancy in &run.discrepancies {
        let fingerprint = discrepancy.fingerprint();
        let correction = status.get(fingerprint.as_str()).copied().unwrap_or("none");
        csv.serialize(ReportRow {
            run_id: run.run_id.to_string(),
            as_of: run.as_of.to_string(),
            account_id: discrepancy.account_id.as_i64(),
            kind: discrepancy.kind().as_str(),
            fingerprint,
            correction,
            message: &discrepancy.message,
        })?;
    }
    csv.flush()?;
    Ok(())
}

/// Write `reconciliation-<as_of>-<run_id>.csv` under `dir`.
pub fn write_report_file(
    dir: &Path,
    run: &RunResult,
    outcomes: &[CorrectionOutcome],
) -> Result<PathBuf, ReportError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("reconciliation-{}-{}.csv", run.as_of, run.run_id));
    write_report(File::create(&path)?, run, outcomes)?;
    Ok(path)
}
