use crate::metrics::{self, ErrorSource};
use chrono::Utc;
use sidx_core::{
    filter_ids, partition_ids, Indexer, IndexerError, IndexerRegistry, IndexerVersions, Job,
    RegistryError, StateBatch, StateStore, StateStoreError, DEFAULT_BATCH_SIZE,
};
use sidx_storage::{ReindexStore, StorageError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReindexerConfig {
    /// Maximum state IDs handed to one `Index` call.
    pub batch_size: usize,
    /// Pause after a failed claim or store operation.
    pub failure_backoff: Duration,
    /// Pause between attempts to enumerate primary state IDs.
    pub enumerate_backoff: Duration,
    /// Pause when the queue has nothing to claim. Zero only yields.
    pub idle_poll_interval: Duration,
}

impl Default for ReindexerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            failure_backoff: Duration::from_secs(60),
            enumerate_backoff: Duration::from_secs(5),
            idle_poll_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReindexError {
    #[error("prepare reindex of {indexer_id}: {source}")]
    Prepare {
        indexer_id: String,
        #[source]
        source: IndexerError,
    },
    #[error("index {network_id} states into {indexer_id}: {source}")]
    Reindex {
        indexer_id: String,
        network_id: String,
        #[source]
        source: IndexerError,
    },
    #[error("index {network_id} states into {indexer_id}: all {failed} states errored")]
    AllStatesFailed {
        indexer_id: String,
        network_id: String,
        failed: usize,
    },
    #[error("complete reindex of {indexer_id}: {source}")]
    Complete {
        indexer_id: String,
        #[source]
        source: IndexerError,
    },
    #[error("state store error: {0}")]
    StateStore(#[from] StateStoreError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("reindex cancelled")]
    Cancelled,
}

impl ReindexError {
    /// Stage label used in logs and metrics.
    pub fn cause(&self) -> &'static str {
        match self {
            ReindexError::Prepare { .. } => "prepare",
            ReindexError::Reindex { .. } | ReindexError::AllStatesFailed { .. } => "reindex",
            ReindexError::Complete { .. } => "complete",
            ReindexError::StateStore(_) | ReindexError::Storage(_) => "store",
            ReindexError::Registry(_) => "registry",
            ReindexError::Cancelled => "cancelled",
        }
    }
}

/// Replays primary state through indexers whose version changed.
///
/// Any number of reindexers may run `run` against the same queue; claims are
/// arbitrated by the store. `run_unsafe` bypasses the queue and must not run
/// alongside `run`.
pub struct Reindexer {
    store: Arc<ReindexStore>,
    states: Arc<dyn StateStore>,
    config: ReindexerConfig,
}

impl Reindexer {
    pub fn new(
        store: Arc<ReindexStore>,
        states: Arc<dyn StateStore>,
        config: ReindexerConfig,
    ) -> Self {
        Self {
            store,
            states,
            config,
        }
    }

    pub fn store(&self) -> &Arc<ReindexStore> {
        &self.store
    }

    fn registry(&self) -> &Arc<IndexerRegistry> {
        self.store.registry()
    }

    /// Claims and executes queued jobs until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(event = "reindexer_started");
        let mut populated_generation = None;
        let mut batches = None;

        while !cancel.is_cancelled() {
            let generation = self.registry().generation();
            if populated_generation != Some(generation) {
                self.store.populate_jobs(Utc::now());
                populated_generation = Some(generation);
                batches = None;
            }
            self.report_status_metrics();

            match self.claim_and_execute(&cancel, &mut batches).await {
                Ok(true) => {}
                Ok(false) => {
                    if self.config.idle_poll_interval.is_zero() {
                        tokio::task::yield_now().await;
                    } else if sleep_or_cancel(&cancel, self.config.idle_poll_interval).await {
                        break;
                    }
                }
                Err(ReindexError::Cancelled) => break,
                Err(err) => {
                    error!(
                        event = "reindex_iteration_failed",
                        cause = err.cause(),
                        error = %err,
                        backoff_secs = self.config.failure_backoff.as_secs()
                    );
                    if sleep_or_cancel(&cancel, self.config.failure_backoff).await {
                        break;
                    }
                }
            }
        }
        info!(event = "reindexer_stopped");
    }

    /// Runs the jobs implied by current versions directly, without claiming
    /// them, and persists each new actual version. `on_update` receives one
    /// line per finished job.
    pub async fn run_unsafe<F>(
        &self,
        indexer_id: Option<&str>,
        cancel: &CancellationToken,
        mut on_update: F,
    ) -> Result<(), ReindexError>
    where
        F: FnMut(String) + Send,
    {
        if let Some(id) = indexer_id {
            self.registry().get_indexer(id)?;
        }

        let jobs = self
            .store
            .get_indexer_versions()?
            .iter()
            .filter(|versions| indexer_id.map_or(true, |id| versions.indexer_id == id))
            .filter_map(IndexerVersions::job)
            .collect::<Vec<_>>();
        if jobs.is_empty() {
            on_update("all indexers are up to date".to_string());
            return Ok(());
        }

        let batches = self.get_reindex_batches(cancel).await?;
        for job in jobs {
            let indexer = match self.registry().get_indexer(&job.indexer_id) {
                Ok(indexer) => indexer,
                Err(RegistryError::NotFound(_)) => {
                    on_update(format!("skipped job {job}: indexer not registered"));
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let started = Instant::now();
            if let Err(err) = self
                .execute_job(indexer.as_ref(), &job, &batches, cancel)
                .await
            {
                metrics::record_indexer_error(
                    &job.indexer_id,
                    job.to,
                    ErrorSource::Reindex,
                    err.cause(),
                );
                return Err(err);
            }
            self.store
                .set_indexer_actual_version(&job.indexer_id, job.to)?;

            let elapsed = started.elapsed();
            metrics::set_actual_version(&job.indexer_id, job.to);
            metrics::set_job_duration(&job.indexer_id, elapsed);
            info!(
                event = "reindex_unsafe_job_completed",
                job = %job,
                elapsed_ms = elapsed.as_millis() as u64
            );
            on_update(format!("completed job {job} in {elapsed:.2?}"));
        }
        Ok(())
    }

    /// Drives one indexer through prepare, every matching batch, and complete.
    ///
    /// Stops at the first failure. Batches whose states all failed count as a
    /// failure; partial per-state failures are logged and metered only.
    pub async fn execute_job(
        &self,
        indexer: &dyn Indexer,
        job: &Job,
        batches: &[StateBatch],
        cancel: &CancellationToken,
    ) -> Result<(), ReindexError> {
        let indexer_id = job.indexer_id.as_str();
        indexer
            .prepare_reindex(job.from, job.to, job.is_first())
            .await
            .map_err(|source| ReindexError::Prepare {
                indexer_id: indexer_id.to_string(),
                source,
            })?;

        let subscriptions = indexer.subscriptions();
        for batch in batches {
            if cancel.is_cancelled() {
                return Err(ReindexError::Cancelled);
            }

            let ids = filter_ids(&subscriptions, &batch.ids);
            if ids.is_empty() {
                continue;
            }
            let states = self.states.get_states(&batch.network_id, &ids).await?;
            if states.is_empty() {
                continue;
            }

            let errors = indexer
                .index(&batch.network_id, &states)
                .await
                .map_err(|source| ReindexError::Reindex {
                    indexer_id: indexer_id.to_string(),
                    network_id: batch.network_id.clone(),
                    source,
                })?;
            if errors.is_empty() {
                continue;
            }
            if states.keys().all(|id| errors.contains_key(id)) {
                return Err(ReindexError::AllStatesFailed {
                    indexer_id: indexer_id.to_string(),
                    network_id: batch.network_id.clone(),
                    failed: states.len(),
                });
            }
            warn!(
                event = "reindex_per_state_errors",
                indexer_id = %indexer_id,
                network_id = %batch.network_id,
                failed = errors.len(),
                total = states.len()
            );
            metrics::record_per_state_errors(indexer_id, ErrorSource::Reindex, errors.len());
        }

        indexer
            .complete_reindex(job.from, job.to)
            .await
            .map_err(|source| ReindexError::Complete {
                indexer_id: indexer_id.to_string(),
                source,
            })?;
        Ok(())
    }

    /// Enumerates all primary state IDs, retrying until it succeeds or
    /// `cancel` fires, and pages them per network.
    pub async fn get_reindex_batches(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<StateBatch>, ReindexError> {
        loop {
            match self.states.get_all_ids().await {
                Ok(ids) => {
                    let batches = partition_ids(&ids, self.config.batch_size);
                    debug!(
                        event = "reindex_batches_computed",
                        networks = ids.len(),
                        batches = batches.len()
                    );
                    return Ok(batches);
                }
                Err(err) => {
                    warn!(
                        event = "state_enumeration_failed",
                        error = %err,
                        backoff_secs = self.config.enumerate_backoff.as_secs()
                    );
                    if sleep_or_cancel(cancel, self.config.enumerate_backoff).await {
                        return Err(ReindexError::Cancelled);
                    }
                }
            }
        }
    }

    /// Returns `Ok(false)` when nothing was claimable.
    async fn claim_and_execute(
        &self,
        cancel: &CancellationToken,
        cached_batches: &mut Option<Vec<StateBatch>>,
    ) -> Result<bool, ReindexError> {
        let Some(job) = self.store.claim_available_job(Utc::now())? else {
            return Ok(false);
        };
        info!(event = "reindex_job_claimed", job = %job);

        if cached_batches.is_none() {
            *cached_batches = Some(self.get_reindex_batches(cancel).await?);
        }
        let batches = cached_batches.as_deref().unwrap_or_default();

        let started = Instant::now();
        let outcome = match self.registry().get_indexer(&job.indexer_id) {
            Ok(indexer) => {
                self.execute_job(indexer.as_ref(), &job, batches, cancel)
                    .await
            }
            Err(err) => Err(err.into()),
        };

        match outcome {
            Ok(()) => {
                self.store.complete_job(&job, None, Utc::now())?;
                metrics::set_actual_version(&job.indexer_id, job.to);
                info!(event = "reindex_job_completed", job = %job);
            }
            Err(ReindexError::Cancelled) => {
                info!(event = "reindex_job_abandoned", job = %job);
                return Err(ReindexError::Cancelled);
            }
            Err(err) => {
                metrics::record_indexer_error(
                    &job.indexer_id,
                    job.to,
                    ErrorSource::Reindex,
                    err.cause(),
                );
                warn!(
                    event = "reindex_job_failed",
                    job = %job,
                    cause = err.cause(),
                    error = %err
                );
                self.store
                    .complete_job(&job, Some(&err.to_string()), Utc::now())?;
            }
        }
        metrics::set_job_duration(&job.indexer_id, started.elapsed());
        Ok(true)
    }

    fn report_status_metrics(&self) {
        match self.store.get_job_infos(Utc::now()) {
            Ok(infos) => infos.iter().for_each(metrics::report_job_info),
            Err(err) => warn!(event = "reindex_status_read_failed", error = %err),
        }
    }
}

/// Sleeps for `duration`; returns `true` if `cancel` fired first.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
