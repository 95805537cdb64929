//! HTTP surface of the state indexing coordinator: indexer version reporting,
//! manual reindex triggering and primary state ingestion.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sidx_core::{JobStatus, RegistryError, StateId, Version};
use sidx_indexer::{OnlineDispatcher, ReindexError, Reindexer};
use sidx_storage::{SqliteStateStore, StorageError};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Requests carrying this header come from a device gateway.
pub const GATEWAY_ID_HEADER: &str = "x-gateway-id";

pub struct AppState {
    pub reindexer: Arc<Reindexer>,
    pub dispatcher: Arc<OnlineDispatcher>,
    pub states: Arc<SqliteStateStore>,
    /// When set, manual reindexing requires `force`.
    pub auto_reindex: bool,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("administrative endpoint is not available to device gateways")]
    Forbidden,
    #[error("{0}")]
    PreconditionFailed(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("reindex error: {0}")]
    Reindex(#[from] ReindexError),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ServiceError {
    fn status(&self) -> StatusCode {
        match self {
            ServiceError::Forbidden => StatusCode::FORBIDDEN,
            ServiceError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Reindex(ReindexError::Registry(RegistryError::NotFound(_))) => {
                StatusCode::NOT_FOUND
            }
            ServiceError::Storage(_) | ServiceError::Reindex(_) | ServiceError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(event = "request_failed", status = status.as_u16(), error = %self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerView {
    pub actual: Version,
    pub desired: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReindexRequest {
    /// Empty means every indexer.
    #[serde(default)]
    pub indexer_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReportedState {
    #[serde(rename = "type")]
    pub state_type: String,
    pub device_id: String,
    pub value: Value,
}

pub fn build_router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/v1/indexers", get(get_indexers))
        .route("/v1/reindex", post(start_reindex))
        .route("/v1/networks/:network_id/states", post(report_states))
        .with_state(app)
}

// SQLite calls wait on the database lock, so they run off the async workers.
async fn run_blocking<T, F>(task: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(task).await??)
}

fn reject_gateway(headers: &HeaderMap) -> Result<(), ServiceError> {
    if headers.contains_key(GATEWAY_ID_HEADER) {
        return Err(ServiceError::Forbidden);
    }
    Ok(())
}

async fn get_indexers(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<String, IndexerView>>, ServiceError> {
    reject_gateway(&headers)?;
    let store = app.reindexer.store().clone();
    let (versions, infos) = run_blocking(move || {
        let versions = store.get_indexer_versions()?;
        let infos = store.get_job_infos(Utc::now())?;
        Ok((versions, infos))
    })
    .await?;

    let mut views = versions
        .into_iter()
        .map(|versions| {
            (
                versions.indexer_id,
                IndexerView {
                    actual: versions.actual,
                    desired: versions.desired,
                    status: None,
                    attempts: None,
                    error: None,
                },
            )
        })
        .collect::<BTreeMap<_, _>>();

    for info in infos {
        if let Some(view) = views.get_mut(&info.indexer_id) {
            view.status = Some(info.status);
            view.attempts = Some(info.attempts);
            view.error = (!info.error.is_empty()).then_some(info.error);
        }
    }
    Ok(Json(views))
}

async fn start_reindex(
    State(app): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ReindexRequest>,
) -> Result<Response, ServiceError> {
    reject_gateway(&headers)?;
    if app.auto_reindex && !request.force {
        return Err(ServiceError::PreconditionFailed(
            "automatic reindexing is enabled; set force to reindex manually".to_string(),
        ));
    }

    let indexer_id = Some(request.indexer_id.trim().to_string()).filter(|id| !id.is_empty());
    if let Some(id) = &indexer_id {
        app.reindexer
            .store()
            .registry()
            .get_indexer(id)
            .map_err(|err| ServiceError::NotFound(err.to_string()))?;
    }

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let reindexer = app.reindexer.clone();
    let cancel = app.shutdown.child_token();
    tokio::spawn(async move {
        info!(event = "manual_reindex_started", indexer_id = ?indexer_id);
        let updates = tx.clone();
        let result = reindexer
            .run_unsafe(indexer_id.as_deref(), &cancel, move |line| {
                let _ = updates.send(line);
            })
            .await;
        match result {
            Ok(()) => info!(event = "manual_reindex_finished", indexer_id = ?indexer_id),
            Err(err) => {
                warn!(
                    event = "manual_reindex_failed",
                    indexer_id = ?indexer_id,
                    cause = err.cause(),
                    error = %err
                );
                let _ = tx.send(format!("reindex failed: {err}"));
            }
        }
    });

    let lines = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, Infallible>(format!("{line}\n")), rx))
    });
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(lines),
    )
        .into_response())
}

async fn report_states(
    State(app): State<Arc<AppState>>,
    Path(network_id): Path<String>,
    headers: HeaderMap,
    Json(reported): Json<Vec<ReportedState>>,
) -> Result<StatusCode, ServiceError> {
    if network_id.trim().is_empty() {
        return Err(ServiceError::BadRequest("network id is required".to_string()));
    }
    let reporter_id = headers
        .get(GATEWAY_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut values = BTreeMap::new();
    for state in reported {
        if state.state_type.is_empty() || state.device_id.is_empty() {
            return Err(ServiceError::BadRequest(
                "state type and device id are required".to_string(),
            ));
        }
        let value = serde_json::to_vec(&state.value)
            .map_err(|err| ServiceError::BadRequest(err.to_string()))?;
        values.insert(StateId::new(state.state_type, state.device_id), value);
    }
    if values.is_empty() {
        return Ok(StatusCode::NO_CONTENT);
    }

    let states = app.states.clone();
    let stored = {
        let network_id = network_id.clone();
        run_blocking(move || {
            states.report_states(&network_id, &reporter_id, &values, Utc::now())
        })
        .await?
    };
    app.dispatcher.must_index(&network_id, &stored).await;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::http::Request;
    use sidx_core::{
        Indexer, IndexerError, IndexerRegistry, StateErrors, StateStore, StatesById,
        Subscription,
    };
    use sidx_indexer::{DispatchConfig, ReindexerConfig};
    use sidx_storage::{QueueConfig, ReindexStore};
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct FooIndexer {
        version: Version,
        indexed: Mutex<Vec<(String, StatesById)>>,
    }

    #[async_trait]
    impl Indexer for FooIndexer {
        fn id(&self) -> &str {
            "svc-a"
        }

        fn version(&self) -> Version {
            self.version
        }

        fn subscriptions(&self) -> Vec<Subscription> {
            vec![Subscription::all("foo")]
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
            network_id: &str,
            states: &StatesById,
        ) -> Result<StateErrors, IndexerError> {
            self.indexed
                .lock()
                .expect("indexed")
                .push((network_id.to_string(), states.clone()));
            Ok(StateErrors::new())
        }
    }

    struct Harness {
        app: Arc<AppState>,
        indexer: Arc<FooIndexer>,
        _dir: tempfile::TempDir,
    }

    fn harness(auto_reindex: bool) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sidx.db");
        let indexer = Arc::new(FooIndexer {
            version: Version(1),
            indexed: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(IndexerRegistry::new());
        registry
            .register_indexers(vec![indexer.clone()])
            .expect("register");

        let queue = Arc::new(
            ReindexStore::open(&path, registry.clone(), QueueConfig::default()).expect("queue"),
        );
        let states = Arc::new(SqliteStateStore::open(&path).expect("states"));
        let reindexer = Arc::new(Reindexer::new(
            queue,
            states.clone() as Arc<dyn StateStore>,
            ReindexerConfig::default(),
        ));
        let dispatcher = Arc::new(OnlineDispatcher::new(registry, DispatchConfig::default()));

        Harness {
            app: Arc::new(AppState {
                reindexer,
                dispatcher,
                states,
                auto_reindex,
                shutdown: CancellationToken::new(),
            }),
            indexer,
            _dir: dir,
        }
    }

    async fn send(app: &Arc<AppState>, request: Request<Body>) -> (StatusCode, String) {
        let response = build_router(app.clone())
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let harness = harness(false);
        let request = Request::get("/health").body(Body::empty()).expect("request");
        assert_eq!(
            send(&harness.app, request).await,
            (StatusCode::OK, "ok".to_string())
        );
    }

    #[tokio::test]
    async fn indexers_view_reports_versions_and_job_state() {
        let harness = harness(false);
        assert!(harness.app.reindexer.store().populate_jobs(Utc::now()));

        let request = Request::get("/v1/indexers").body(Body::empty()).expect("request");
        let (status, body) = send(&harness.app, request).await;
        assert_eq!(status, StatusCode::OK);
        let views: BTreeMap<String, IndexerView> = serde_json::from_str(&body).expect("json");
        assert_eq!(
            views["svc-a"],
            IndexerView {
                actual: Version(0),
                desired: Version(1),
                status: Some(JobStatus::Available),
                attempts: Some(0),
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn gateways_cannot_call_admin_endpoints() {
        let harness = harness(false);
        let request = Request::get("/v1/indexers")
            .header(GATEWAY_ID_HEADER, "gw-1")
            .body(Body::empty())
            .expect("request");
        assert_eq!(send(&harness.app, request).await.0, StatusCode::FORBIDDEN);

        let mut request = post_json("/v1/reindex", json!({ "force": true }));
        request
            .headers_mut()
            .insert(GATEWAY_ID_HEADER, "gw-1".parse().expect("header"));
        assert_eq!(send(&harness.app, request).await.0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn manual_reindex_requires_force_when_automatic() {
        let harness = harness(true);
        let (status, body) = send(&harness.app, post_json("/v1/reindex", json!({}))).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert!(body.contains("force"));
    }

    #[tokio::test]
    async fn manual_reindex_of_unknown_indexer_is_not_found() {
        let harness = harness(false);
        let request = post_json("/v1/reindex", json!({ "indexer_id": "svc-x" }));
        assert_eq!(send(&harness.app, request).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_reindex_streams_progress_and_advances_versions() {
        let harness = harness(true);
        harness
            .app
            .states
            .report_states(
                "nw-1",
                "gw-1",
                &BTreeMap::from([(StateId::new("foo", "d1"), b"{}".to_vec())]),
                Utc::now(),
            )
            .expect("seed");

        let request = post_json("/v1/reindex", json!({ "indexer_id": "svc-a", "force": true }));
        let (status, body) = send(&harness.app, request).await;
        assert_eq!(status, StatusCode::OK);
        let lines = body.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("completed job {id: svc-a, from: 0, to: 1}"));

        let versions = harness
            .app
            .reindexer
            .store()
            .get_indexer_versions()
            .expect("versions");
        assert_eq!(versions[0].actual, Version(1));
        assert_eq!(harness.indexer.indexed.lock().expect("indexed").len(), 1);
    }

    #[tokio::test]
    async fn reported_states_are_persisted_and_dispatched() {
        let harness = harness(false);
        let request = post_json(
            "/v1/networks/nw-1/states",
            json!([
                { "type": "foo", "device_id": "d1", "value": { "online": true } },
                { "type": "bar", "device_id": "d2", "value": 7 }
            ]),
        );
        assert_eq!(send(&harness.app, request).await.0, StatusCode::NO_CONTENT);

        let indexed = harness.indexer.indexed.lock().expect("indexed").clone();
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].0, "nw-1");
        assert_eq!(
            indexed[0].1.keys().cloned().collect::<Vec<_>>(),
            vec![StateId::new("foo", "d1")]
        );

        let stored = harness
            .app
            .states
            .get_states(
                "nw-1",
                &[StateId::new("foo", "d1"), StateId::new("bar", "d2")],
            )
            .await
            .expect("stored");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[&StateId::new("bar", "d2")].value, b"7".to_vec());
    }

    #[tokio::test]
    async fn malformed_state_report_is_rejected() {
        let harness = harness(false);
        let request = post_json(
            "/v1/networks/nw-1/states",
            json!([{ "type": "", "device_id": "d1", "value": null }]),
        );
        assert_eq!(send(&harness.app, request).await.0, StatusCode::BAD_REQUEST);
    }
}
