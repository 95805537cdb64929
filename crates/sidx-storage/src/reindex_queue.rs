use crate::{open_connection, open_in_memory_connection, StorageError};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use sidx_core::{
    IndexerRegistry, IndexerVersions, Job, JobInfo, JobStatus, Version, DEFAULT_JOB_TIMEOUT_SECS,
    DEFAULT_MAX_ATTEMPTS,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Claims allowed per job before it is reported as errored.
    pub max_attempts: u32,
    /// In-progress jobs older than this are presumed dead and reclaimable.
    pub timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: Duration::seconds(DEFAULT_JOB_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredJob {
    pub(crate) job: Job,
    pub(crate) status: JobStatus,
    pub(crate) attempts: u32,
    pub(crate) error: String,
    pub(crate) last_change: i64,
}

impl StoredJob {
    fn fresh(job: Job, now: i64) -> Self {
        Self {
            job,
            status: JobStatus::Available,
            attempts: 0,
            error: String::new(),
            last_change: now,
        }
    }

    fn is_stalled(&self, timeout_threshold: i64) -> bool {
        match self.status {
            JobStatus::Available => true,
            JobStatus::InProgress => self.last_change < timeout_threshold,
            JobStatus::Complete => false,
        }
    }

    /// Out of attempts and not running: never claimable again as stored.
    fn is_exhausted(&self, max_attempts: u32, timeout_threshold: i64) -> bool {
        self.attempts >= max_attempts && self.is_stalled(timeout_threshold)
    }
}

type JobRow = (String, i64, i64, String, i64, String, i64);

const SELECT_JOBS: &str = "
    SELECT indexer_id, from_version, to_version, status, attempts, error, last_status_change
    FROM reindex_job_queue
";

/// Indexer version bookkeeping and the reindex job queue.
///
/// Safe to share between tasks, and between processes opening the same
/// database file. Every mutation runs in its own `IMMEDIATE` transaction, so
/// writers are serialized by SQLite's database lock: a claim can never hand
/// the same row to two callers, and concurrent `populate_jobs` calls commit
/// one after another against fresh reads.
///
/// Jobs are assumed to finish within `QueueConfig::timeout`. A job running
/// longer can be claimed again by another coordinator, so indexers must
/// tolerate concurrent re-drives of the same version pair. Last writer wins
/// when storing job errors.
pub struct ReindexStore {
    conn: Mutex<Connection>,
    registry: Arc<IndexerRegistry>,
    config: QueueConfig,
}

impl ReindexStore {
    pub fn open(
        path: impl AsRef<Path>,
        registry: Arc<IndexerRegistry>,
        config: QueueConfig,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            conn: Mutex::new(open_connection(path)?),
            registry,
            config,
        })
    }

    pub fn open_in_memory(
        registry: Arc<IndexerRegistry>,
        config: QueueConfig,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            conn: Mutex::new(open_in_memory_connection()?),
            registry,
            config,
        })
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    pub fn registry(&self) -> &Arc<IndexerRegistry> {
        &self.registry
    }

    /// Returns tracked versions merged with the registry's declared versions,
    /// writing the merged view back when it drifted from what was stored.
    pub fn get_indexer_versions(&self) -> Result<Vec<IndexerVersions>, StorageError> {
        let desired = self.registry.desired_versions();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let tracked = read_versions(&tx)?;
        let composed = compose_versions(&tracked, &desired);
        if composed != tracked {
            write_versions(&tx, &composed)?;
            debug!(event = "indexer_versions_reconciled", tracked = composed.len());
        }
        tx.commit()?;

        Ok(composed.into_values().collect())
    }

    /// Adds the jobs implied by out-of-date versions to the queue.
    ///
    /// Returns whether the queue or the version table changed. A failed
    /// transaction is logged and reported as "no update": under contention the
    /// other coordinator that committed computed the same result.
    pub fn populate_jobs(&self, now: DateTime<Utc>) -> bool {
        let desired = self.registry.desired_versions();
        let mut conn = self.lock();
        match populate_jobs_tx(&mut conn, &desired, &self.config, now.timestamp()) {
            Ok(true) => {
                info!(event = "reindex_queue_populated", indexers = desired.len());
                true
            }
            Ok(false) => {
                info!(event = "reindex_queue_unchanged");
                false
            }
            Err(err) => {
                warn!(
                    event = "reindex_queue_populate_failed",
                    error = %err,
                    "ignore if another coordinator instance succeeded"
                );
                false
            }
        }
    }

    /// Claims one available or timed-out job, or `None` when nothing qualifies.
    pub fn claim_available_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, StorageError> {
        let threshold = self.timeout_threshold(now);
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                &format!(
                    "{SELECT_JOBS}
                    WHERE attempts < ?1
                      AND (status = ?2 OR (status = ?3 AND last_status_change < ?4))
                    ORDER BY indexer_id
                    LIMIT 1"
                ),
                params![
                    i64::from(self.config.max_attempts),
                    JobStatus::Available.as_str(),
                    JobStatus::InProgress.as_str(),
                    threshold,
                ],
                job_row,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        let stored = parse_job_row(row)?;

        tx.execute(
            "
            UPDATE reindex_job_queue
            SET status = ?1, attempts = ?2, last_status_change = ?3
            WHERE indexer_id = ?4
            ",
            params![
                JobStatus::InProgress.as_str(),
                i64::from(stored.attempts) + 1,
                now.timestamp(),
                stored.job.indexer_id,
            ],
        )?;
        tx.commit()?;

        debug!(
            event = "reindex_job_claimed",
            indexer_id = %stored.job.indexer_id,
            attempt = stored.attempts + 1
        );
        Ok(Some(stored.job))
    }

    /// Records the outcome of a claimed job.
    ///
    /// Success advances the indexer's actual version to `job.to` and marks the
    /// row complete; failure makes the row available again with the error
    /// text. Returns `false` without touching anything when the queued row no
    /// longer carries the job's version pair (it was superseded).
    pub fn complete_job(
        &self,
        job: &Job,
        failure: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let desired = self
            .registry
            .desired_versions()
            .get(&job.indexer_id)
            .copied()
            .unwrap_or(job.to);
        let (status, error) = match failure {
            None => (JobStatus::Complete, ""),
            Some(message) => (JobStatus::Available, message),
        };

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "
            UPDATE reindex_job_queue
            SET status = ?1, error = ?2, last_status_change = ?3
            WHERE indexer_id = ?4 AND from_version = ?5 AND to_version = ?6
            ",
            params![
                status.as_str(),
                error,
                now.timestamp(),
                job.indexer_id,
                job.from.as_stored(),
                job.to.as_stored(),
            ],
        )?;
        if updated == 0 {
            warn!(event = "reindex_job_superseded", job = %job);
            return Ok(false);
        }

        if failure.is_none() {
            upsert_actual_version(&tx, &job.indexer_id, job.to, desired)?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn get_job_infos(&self, now: DateTime<Utc>) -> Result<Vec<JobInfo>, StorageError> {
        let threshold = self.timeout_threshold(now);
        let jobs = {
            let conn = self.lock();
            read_jobs(&conn, false)?
        };

        Ok(jobs
            .into_values()
            .map(|stored| {
                let error = if self.is_errored(&stored, threshold) {
                    stored.error.clone()
                } else {
                    String::new()
                };
                JobInfo {
                    indexer_id: stored.job.indexer_id,
                    status: stored.status,
                    error,
                    attempts: stored.attempts,
                }
            })
            .collect())
    }

    /// Errors of jobs that used up their attempts and are not progressing.
    pub fn get_all_errors(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, String>, StorageError> {
        let threshold = self.timeout_threshold(now);
        let jobs = {
            let conn = self.lock();
            read_jobs(&conn, false)?
        };

        Ok(jobs
            .into_iter()
            .filter(|(_, stored)| self.is_errored(stored, threshold))
            .map(|(id, stored)| (id, stored.error))
            .collect())
    }

    /// Jobs that have not completed yet, in indexer ID order.
    pub fn get_incomplete_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let conn = self.lock();
        Ok(read_jobs(&conn, true)?
            .into_values()
            .map(|stored| stored.job)
            .collect())
    }

    /// Overwrites an indexer's actual version outside the job protocol.
    pub fn set_indexer_actual_version(
        &self,
        indexer_id: &str,
        version: Version,
    ) -> Result<(), StorageError> {
        let desired = self
            .registry
            .desired_versions()
            .get(indexer_id)
            .copied()
            .unwrap_or(version);
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        upsert_actual_version(&tx, indexer_id, version, desired)?;
        tx.commit()?;
        Ok(())
    }

    fn is_errored(&self, stored: &StoredJob, timeout_threshold: i64) -> bool {
        stored.is_exhausted(self.config.max_attempts, timeout_threshold)
    }

    fn timeout_threshold(&self, now: DateTime<Utc>) -> i64 {
        (now - self.config.timeout).timestamp()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn populate_jobs_tx(
    conn: &mut Connection,
    desired: &BTreeMap<String, Version>,
    config: &QueueConfig,
    now: i64,
) -> Result<bool, StorageError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let tracked = read_versions(&tx)?;
    let composed = compose_versions(&tracked, desired);
    let new_jobs = composed
        .values()
        .filter_map(IndexerVersions::job)
        .collect::<Vec<_>>();
    let old_jobs = read_jobs(&tx, true)?;
    let merged = merge_jobs(&old_jobs, new_jobs, config, now);

    if merged == old_jobs && composed == tracked {
        return Ok(false);
    }

    replace_jobs(&tx, &merged)?;
    write_versions(&tx, &composed)?;
    tx.commit()?;
    Ok(true)
}

/// Tracked rows keep their actual version and take the registry's desired
/// version; registry-only indexers start at actual zero; tracked-only rows
/// are left untouched.
pub(crate) fn compose_versions(
    tracked: &BTreeMap<String, IndexerVersions>,
    desired: &BTreeMap<String, Version>,
) -> BTreeMap<String, IndexerVersions> {
    let mut composed = tracked.clone();
    for (id, version) in desired {
        composed
            .entry(id.clone())
            .and_modify(|existing| existing.desired = *version)
            .or_insert_with(|| IndexerVersions {
                indexer_id: id.clone(),
                actual: Version::ZERO,
                desired: *version,
            });
    }
    composed
}

// New jobs win over incomplete old jobs with a different version pair; an old
// job with the same pair keeps its status and attempts unless it ran out of
// attempts, in which case it is re-queued fresh. Old jobs with no new
// counterpart are carried over.
pub(crate) fn merge_jobs(
    old: &BTreeMap<String, StoredJob>,
    new_jobs: Vec<Job>,
    config: &QueueConfig,
    now: i64,
) -> BTreeMap<String, StoredJob> {
    let threshold = now - config.timeout.num_seconds();
    let mut merged = BTreeMap::new();
    for job in new_jobs {
        let id = job.indexer_id.clone();
        let stored = match old.get(&id) {
            Some(prev) if prev.job.same_versions(&job) => {
                if prev.is_exhausted(config.max_attempts, threshold) {
                    info!(event = "reindex_job_requeued", job = %job, attempts = prev.attempts);
                    StoredJob::fresh(job, now)
                } else {
                    prev.clone()
                }
            }
            Some(prev) => {
                warn!(event = "reindex_job_replaced", previous = %prev.job, next = %job);
                StoredJob::fresh(job, now)
            }
            None => StoredJob::fresh(job, now),
        };
        merged.insert(id, stored);
    }

    for (id, prev) in old {
        merged.entry(id.clone()).or_insert_with(|| prev.clone());
    }
    merged
}

fn read_versions(conn: &Connection) -> Result<BTreeMap<String, IndexerVersions>, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT indexer_id, version_actual, version_desired
        FROM indexer_versions
        ORDER BY indexer_id
        ",
    )?;
    let rows = statement.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut versions = BTreeMap::new();
    for row in rows {
        let (indexer_id, actual_raw, desired_raw) = row?;
        let (Some(actual), Some(desired)) = (
            Version::from_stored(actual_raw),
            Version::from_stored(desired_raw),
        ) else {
            return Err(StorageError::VersionOutOfRange {
                indexer_id,
                actual: actual_raw,
                desired: desired_raw,
            });
        };
        versions.insert(
            indexer_id.clone(),
            IndexerVersions {
                indexer_id,
                actual,
                desired,
            },
        );
    }
    Ok(versions)
}

fn write_versions(
    tx: &Transaction<'_>,
    versions: &BTreeMap<String, IndexerVersions>,
) -> Result<(), StorageError> {
    tx.execute("DELETE FROM indexer_versions", [])?;
    let mut insert = tx.prepare(
        "
        INSERT INTO indexer_versions (indexer_id, version_actual, version_desired)
        VALUES (?1, ?2, ?3)
        ",
    )?;
    for version in versions.values() {
        insert.execute(params![
            version.indexer_id,
            version.actual.as_stored(),
            version.desired.as_stored(),
        ])?;
    }
    Ok(())
}

fn upsert_actual_version(
    tx: &Transaction<'_>,
    indexer_id: &str,
    actual: Version,
    desired: Version,
) -> Result<(), StorageError> {
    tx.execute(
        "
        INSERT INTO indexer_versions (indexer_id, version_actual, version_desired)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(indexer_id) DO UPDATE SET
            version_actual=excluded.version_actual
        ",
        params![indexer_id, actual.as_stored(), desired.as_stored()],
    )?;
    Ok(())
}

fn read_jobs(
    conn: &Connection,
    incomplete_only: bool,
) -> Result<BTreeMap<String, StoredJob>, StorageError> {
    let mut statement = conn.prepare(&format!("{SELECT_JOBS} ORDER BY indexer_id"))?;
    let rows = statement.query_map([], job_row)?;

    let mut jobs = BTreeMap::new();
    for row in rows {
        let stored = parse_job_row(row?)?;
        if incomplete_only && stored.status == JobStatus::Complete {
            continue;
        }
        jobs.insert(stored.job.indexer_id.clone(), stored);
    }
    Ok(jobs)
}

fn replace_jobs(
    tx: &Transaction<'_>,
    jobs: &BTreeMap<String, StoredJob>,
) -> Result<(), StorageError> {
    tx.execute("DELETE FROM reindex_job_queue", [])?;
    let mut insert = tx.prepare(
        "
        INSERT INTO reindex_job_queue (
            indexer_id,
            from_version,
            to_version,
            status,
            attempts,
            error,
            last_status_change
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
    )?;
    for stored in jobs.values() {
        insert.execute(params![
            stored.job.indexer_id,
            stored.job.from.as_stored(),
            stored.job.to.as_stored(),
            stored.status.as_str(),
            i64::from(stored.attempts),
            stored.error,
            stored.last_change,
        ])?;
    }
    Ok(())
}

fn job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn parse_job_row(row: JobRow) -> Result<StoredJob, StorageError> {
    let (indexer_id, from_raw, to_raw, status_raw, attempts_raw, error, last_change) = row;
    let (Some(from), Some(to)) = (Version::from_stored(from_raw), Version::from_stored(to_raw))
    else {
        return Err(StorageError::VersionOutOfRange {
            indexer_id,
            actual: from_raw,
            desired: to_raw,
        });
    };
    let status = status_raw
        .parse::<JobStatus>()
        .map_err(StorageError::Serialization)?;
    let attempts = u32::try_from(attempts_raw).map_err(|_| {
        StorageError::Serialization(format!(
            "invalid attempt count {attempts_raw} for indexer {indexer_id}"
        ))
    })?;

    Ok(StoredJob {
        job: Job {
            indexer_id,
            from,
            to,
        },
        status,
        attempts,
        error,
        last_change,
    })
}
