//! Signals emitted by the reindexer and the online dispatcher.
//!
//! Only the `metrics` facade is used here; installing a recorder/exporter is
//! left to the embedding process.

use metrics::{counter, gauge};
use sidx_core::{JobInfo, JobStatus, Version};
use std::time::Duration;

/// Which indexing path observed an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Online,
    Reindex,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::Online => "online",
            ErrorSource::Reindex => "reindex",
        }
    }
}

/// Numeric encoding of a job's status for the status gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatusGauge {
    Available = 0,
    InProgress = 1,
    Complete = 2,
    Errored = 3,
}

impl JobStatusGauge {
    pub fn from_info(info: &JobInfo) -> Self {
        if !info.error.is_empty() {
            return JobStatusGauge::Errored;
        }
        match info.status {
            JobStatus::Available => JobStatusGauge::Available,
            JobStatus::InProgress => JobStatusGauge::InProgress,
            JobStatus::Complete => JobStatusGauge::Complete,
        }
    }
}

pub fn record_indexer_error(indexer_id: &str, version: Version, source: ErrorSource, cause: &str) {
    counter!(
        "state_indexer_errors_total",
        "indexer_id" => indexer_id.to_string(),
        "indexer_version" => version.to_string(),
        "source" => source.as_str(),
        "cause" => cause.to_string()
    )
    .increment(1);
}

pub fn record_per_state_errors(indexer_id: &str, source: ErrorSource, failed: usize) {
    counter!(
        "state_indexer_per_state_errors_total",
        "indexer_id" => indexer_id.to_string(),
        "source" => source.as_str()
    )
    .increment(failed as u64);
}

pub fn set_actual_version(indexer_id: &str, version: Version) {
    gauge!(
        "state_indexer_actual_version",
        "indexer_id" => indexer_id.to_string()
    )
    .set(f64::from(version.0));
}

/// Publishes the status and attempt gauges for one job.
pub fn report_job_info(info: &JobInfo) {
    gauge!(
        "state_reindex_job_status",
        "indexer_id" => info.indexer_id.clone()
    )
    .set(JobStatusGauge::from_info(info) as u8 as f64);
    gauge!(
        "state_reindex_job_attempts",
        "indexer_id" => info.indexer_id.clone()
    )
    .set(f64::from(info.attempts));
}

pub fn set_job_duration(indexer_id: &str, duration: Duration) {
    gauge!(
        "state_reindex_job_duration_seconds",
        "indexer_id" => indexer_id.to_string()
    )
    .set(duration.as_secs_f64());
}
