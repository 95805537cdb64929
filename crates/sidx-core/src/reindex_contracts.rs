use crate::indexer::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_JOB_TIMEOUT_SECS: i64 = 5 * 60;
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Available,
    InProgress,
    Complete,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Available => "available",
            JobStatus::InProgress => "in_progress",
            JobStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "available" => Ok(JobStatus::Available),
            "in_progress" => Ok(JobStatus::InProgress),
            "complete" => Ok(JobStatus::Complete),
            other => Err(format!("Unknown job status: {other}")),
        }
    }
}

/// Pending migration of one indexer from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub indexer_id: String,
    pub from: Version,
    pub to: Version,
}

impl Job {
    pub fn new(indexer_id: impl Into<String>, from: Version, to: Version) -> Self {
        Self {
            indexer_id: indexer_id.into(),
            from,
            to,
        }
    }

    pub fn is_first(&self) -> bool {
        self.from.is_zero()
    }

    pub fn same_versions(&self, other: &Job) -> bool {
        self.from == other.from && self.to == other.to
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id: {}, from: {}, to: {}}}",
            self.indexer_id, self.from, self.to
        )
    }
}

/// Read view of a queued job. `error` is only set once the job has used up
/// its attempts and is not making progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub indexer_id: String,
    pub status: JobStatus,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerVersions {
    pub indexer_id: String,
    pub actual: Version,
    pub desired: Version,
}

impl IndexerVersions {
    pub fn needs_reindex(&self) -> bool {
        self.actual != self.desired
    }

    /// The job that brings `actual` up to `desired`, if one is needed.
    pub fn job(&self) -> Option<Job> {
        self.needs_reindex()
            .then(|| Job::new(self.indexer_id.clone(), self.actual, self.desired))
    }
}

impl fmt::Display for IndexerVersions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id: {}, actual: {}, desired: {}}}",
            self.indexer_id, self.actual, self.desired
        )
    }
}
