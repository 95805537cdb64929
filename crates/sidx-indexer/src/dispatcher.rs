use crate::metrics::{self, ErrorSource};
use futures_util::stream::{self, StreamExt};
use sidx_core::{filter_states, Indexer, IndexerError, IndexerRegistry, StateErrors, StatesById};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Indexers called concurrently.
    pub workers: usize,
    /// Calls per indexer before giving up, including the first.
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_attempts: 3,
            retry_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("index into {indexer_id}: {source}")]
    Call {
        indexer_id: String,
        #[source]
        source: IndexerError,
    },
    #[error("index into {indexer_id}: all {failed} states errored")]
    AllStatesFailed { indexer_id: String, failed: usize },
}

impl DispatchError {
    pub fn indexer_id(&self) -> &str {
        match self {
            DispatchError::Call { indexer_id, .. }
            | DispatchError::AllStatesFailed { indexer_id, .. } => indexer_id,
        }
    }

    pub fn cause(&self) -> &'static str {
        match self {
            DispatchError::Call { .. } => "index",
            DispatchError::AllStatesFailed { .. } => "all_states",
        }
    }
}

/// Outcome of fanning one write out to every subscribed indexer.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Indexers that still failed after all attempts.
    pub failures: Vec<DispatchError>,
    /// Per-state errors from calls that were otherwise delivered, by indexer.
    pub state_errors: BTreeMap<String, StateErrors>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Forwards freshly written primary state to the indexers subscribed to it.
pub struct OnlineDispatcher {
    registry: Arc<IndexerRegistry>,
    config: DispatchConfig,
}

impl OnlineDispatcher {
    pub fn new(registry: Arc<IndexerRegistry>, config: DispatchConfig) -> Self {
        Self { registry, config }
    }

    /// Calls every subscribed indexer concurrently, retrying each on failure.
    /// Failures are returned, never acted upon.
    pub async fn index(&self, network_id: &str, states: &StatesById) -> DispatchReport {
        let indexers = self.registry.get_indexers();
        let calls: Vec<_> = indexers
            .into_iter()
            .map(|indexer| async move {
                let id = indexer.id().to_string();
                (id, self.index_with_retry(indexer.as_ref(), network_id, states).await)
            })
            .collect();
        let outcomes = stream::iter(calls)
            .buffer_unordered(self.config.workers.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut report = DispatchReport::default();
        for (indexer_id, outcome) in outcomes {
            match outcome {
                Ok(errors) if errors.is_empty() => {}
                Ok(errors) => {
                    report.state_errors.insert(indexer_id, errors);
                }
                Err(err) => report.failures.push(err),
            }
        }
        report.failures.sort_by(|a, b| a.indexer_id().cmp(b.indexer_id()));
        report
    }

    /// Like `index`, but terminates the process when any indexer could not be
    /// reached after all attempts. A supervisor is expected to restart it.
    pub async fn must_index(&self, network_id: &str, states: &StatesById) -> DispatchReport {
        let report = self.index(network_id, states).await;
        if !report.is_success() {
            for failure in &report.failures {
                error!(
                    event = "online_index_failed",
                    network_id = %network_id,
                    indexer_id = %failure.indexer_id(),
                    error = %failure
                );
            }
            error!(
                event = "online_index_fatal",
                failed_indexers = report.failures.len(),
                "exiting after unrecoverable online indexing failure"
            );
            std::process::exit(1);
        }
        report
    }

    async fn index_with_retry(
        &self,
        indexer: &dyn Indexer,
        network_id: &str,
        states: &StatesById,
    ) -> Result<StateErrors, DispatchError> {
        let filtered = filter_states(&indexer.subscriptions(), states);
        if filtered.is_empty() {
            return Ok(StateErrors::new());
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match index_once(indexer, network_id, &filtered).await {
                Ok(errors) => {
                    if !errors.is_empty() {
                        warn!(
                            event = "online_index_per_state_errors",
                            indexer_id = %indexer.id(),
                            network_id = %network_id,
                            failed = errors.len(),
                            total = filtered.len()
                        );
                        metrics::record_per_state_errors(
                            indexer.id(),
                            ErrorSource::Online,
                            errors.len(),
                        );
                    }
                    return Ok(errors);
                }
                Err(err) => {
                    metrics::record_indexer_error(
                        indexer.id(),
                        indexer.version(),
                        ErrorSource::Online,
                        err.cause(),
                    );
                    if attempt >= max_attempts {
                        return Err(err);
                    }
                    warn!(
                        event = "online_index_retry",
                        indexer_id = %indexer.id(),
                        attempt,
                        error = %err
                    );
                    tokio::time::sleep(self.config.retry_interval).await;
                    attempt += 1;
                }
            }
        }
    }
}

async fn index_once(
    indexer: &dyn Indexer,
    network_id: &str,
    states: &StatesById,
) -> Result<StateErrors, DispatchError> {
    let errors = indexer
        .index(network_id, states)
        .await
        .map_err(|source| DispatchError::Call {
            indexer_id: indexer.id().to_string(),
            source,
        })?;
    if !errors.is_empty() && states.keys().all(|id| errors.contains_key(id)) {
        return Err(DispatchError::AllStatesFailed {
            indexer_id: indexer.id().to_string(),
            failed: states.len(),
        });
    }
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sidx_core::{SerializedState, StateId, Subscription, Version};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Accept,
        FailCalls(usize),
        RejectDevices(Vec<&'static str>),
    }

    struct CountingIndexer {
        id: String,
        subscriptions: Vec<Subscription>,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl CountingIndexer {
        fn new(id: &str, subscriptions: Vec<Subscription>, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                subscriptions,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Indexer for CountingIndexer {
        fn id(&self) -> &str {
            &self.id
        }

        fn version(&self) -> Version {
            Version(1)
        }

        fn subscriptions(&self) -> Vec<Subscription> {
            self.subscriptions.clone()
        }

        async fn prepare_reindex(
            &self,
            _from: Version,
            _to: Version,
            _is_first: bool,
        ) -> Result<(), IndexerError> {
            Ok(())
        }

        async fn complete_reindex(&self, _from: Version, _to: Version) -> Result<(), IndexerError> {
            Ok(())
        }

        async fn index(
            &self,
            _network_id: &str,
            states: &StatesById,
        ) -> Result<StateErrors, IndexerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Accept => Ok(StateErrors::new()),
                Behavior::FailCalls(n) if call < *n => Err(IndexerError::new("unavailable")),
                Behavior::FailCalls(_) => Ok(StateErrors::new()),
                Behavior::RejectDevices(devices) => Ok(states
                    .keys()
                    .filter(|id| devices.contains(&id.device_id.as_str()))
                    .map(|id| (id.clone(), "malformed".to_string()))
                    .collect()),
            }
        }
    }

    fn states(ids: &[(&str, &str)]) -> StatesById {
        ids.iter()
            .map(|(state_type, device)| {
                (
                    StateId::new(*state_type, *device),
                    SerializedState {
                        value: b"{}".to_vec(),
                        version: 1,
                        reporter_id: "gw-1".to_string(),
                        time_ms: 0,
                    },
                )
            })
            .collect()
    }

    fn dispatcher(indexers: Vec<Arc<dyn Indexer>>) -> OnlineDispatcher {
        let registry = Arc::new(IndexerRegistry::new());
        registry.register_indexers(indexers).expect("register");
        OnlineDispatcher::new(registry, DispatchConfig::default())
    }

    #[tokio::test]
    async fn indexers_without_matching_states_are_not_called() {
        let foo = CountingIndexer::new("svc-foo", vec![Subscription::all("foo")], Behavior::Accept);
        let bar = CountingIndexer::new("svc-bar", vec![Subscription::all("bar")], Behavior::Accept);
        let dispatcher = dispatcher(vec![foo.clone(), bar.clone()]);

        let report = dispatcher
            .index("nw-1", &states(&[("foo", "d1"), ("foo", "d2")]))
            .await;
        assert!(report.is_success());
        assert_eq!(foo.calls(), 1);
        assert_eq!(bar.calls(), 0);
    }

    #[tokio::test]
    async fn partial_state_errors_are_delivered_and_reported() {
        let indexer = CountingIndexer::new(
            "svc-a",
            vec![Subscription::all("foo")],
            Behavior::RejectDevices(vec!["d2"]),
        );
        let dispatcher = dispatcher(vec![indexer.clone()]);

        let report = dispatcher
            .index("nw-1", &states(&[("foo", "d1"), ("foo", "d2"), ("foo", "d3")]))
            .await;
        assert!(report.is_success());
        assert_eq!(indexer.calls(), 1);
        assert_eq!(report.state_errors["svc-a"].len(), 1);
        assert!(report.state_errors["svc-a"].contains_key(&StateId::new("foo", "d2")));
    }

    #[tokio::test(start_paused = true)]
    async fn all_states_failing_is_retried_then_reported() {
        let indexer = CountingIndexer::new(
            "svc-a",
            vec![Subscription::all("foo")],
            Behavior::RejectDevices(vec!["d1", "d2"]),
        );
        let dispatcher = dispatcher(vec![indexer.clone()]);

        let report = dispatcher
            .index("nw-1", &states(&[("foo", "d1"), ("foo", "d2")]))
            .await;
        assert_eq!(indexer.calls(), 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].indexer_id(), "svc-a");
        assert_eq!(report.failures[0].cause(), "all_states");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_call_failure_recovers_within_attempts() {
        let flaky = CountingIndexer::new(
            "svc-flaky",
            vec![Subscription::prefix("foo", "d")],
            Behavior::FailCalls(2),
        );
        let steady = CountingIndexer::new(
            "svc-steady",
            vec![Subscription::all("foo")],
            Behavior::Accept,
        );
        let dispatcher = dispatcher(vec![flaky.clone(), steady.clone()]);

        let started = tokio::time::Instant::now();
        let report = dispatcher.index("nw-1", &states(&[("foo", "d1")])).await;
        assert!(report.is_success());
        assert_eq!(flaky.calls(), 3);
        assert_eq!(steady.calls(), 1);
        assert!(started.elapsed() >= Duration::from_secs(20));
    }
}
