//! Batch runs, job entry points and the periodic scheduler.

pub mod batch;
pub mod jobs;
pub mod periodic;

pub use batch::{BatchError, BatchRunner, BatchSummary};
pub use jobs::{CleanupJob, JobError, ReconciliationJob};
pub use periodic::PeriodicScheduler;
