//! REST API handlers for upgrade session management.

use std::convert::Infallible;
use std::pin::Pin;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use cutover_session::{SessionError, UpgradeRequest};
use cutover_state::{
    AgentVersion, AggregateHealth, DeploymentStrategy, FailureDetail, Outcome, SessionEvent,
    SessionState, UpgradeSession, UpgradeStep,
};

use crate::ApiState;

/// Response wrapper for all endpoints.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn api_error(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn error_status(err: &SessionError) -> StatusCode {
    match err {
        SessionError::Validation(_) | SessionError::SameVersion { .. } => StatusCode::BAD_REQUEST,
        SessionError::Busy(_) => StatusCode::CONFLICT,
        SessionError::UnknownVersion(_) | SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Serializable session snapshot for API responses.
#[derive(serde::Serialize)]
pub struct SessionView {
    pub id: String,
    pub agent_ids: Vec<String>,
    pub from_version: String,
    pub to_version: String,
    pub strategy: &'static str,
    pub state: SessionState,
    pub progress_percentage: u8,
    pub rollback_progress_percentage: u8,
    pub steps: Vec<UpgradeStep>,
    pub rollback_steps: Vec<UpgradeStep>,
    pub health: Option<AggregateHealth>,
    pub rollback_eligible: bool,
    pub outcome: Option<Outcome>,
    pub failure: Option<FailureDetail>,
    pub created_at: u64,
    pub updated_at: u64,
    pub finished_at: Option<u64>,
}

impl From<&UpgradeSession> for SessionView {
    fn from(s: &UpgradeSession) -> Self {
        Self {
            id: s.id.clone(),
            agent_ids: s.agent_ids.clone(),
            from_version: s.from_version.clone(),
            to_version: s.to_version.clone(),
            strategy: s.strategy.kind(),
            state: s.state,
            progress_percentage: s.progress_percentage(),
            rollback_progress_percentage: s.rollback_progress_percentage(),
            steps: s.steps.clone(),
            rollback_steps: s.rollback_steps.clone(),
            health: s.health.as_ref().map(|h| h.status),
            rollback_eligible: s.rollback_eligible,
            outcome: s.outcome,
            failure: s.failure.clone(),
            created_at: s.created_at,
            updated_at: s.updated_at,
            finished_at: s.finished_at,
        }
    }
}

/// Request body to start an upgrade session.
#[derive(serde::Deserialize)]
pub struct StartUpgradeRequest {
    pub agent_ids: Vec<String>,
    pub to_version: String,
    pub strategy: DeploymentStrategy,
}

/// POST /api/v1/upgrades
pub async fn start_upgrade(
    State(state): State<ApiState>,
    Json(req): Json<StartUpgradeRequest>,
) -> impl IntoResponse {
    let request = UpgradeRequest {
        agent_ids: req.agent_ids,
        to_version: req.to_version,
        strategy: req.strategy,
    };
    match state.manager.start_upgrade(request).await {
        Ok(session) => {
            (StatusCode::CREATED, ApiResponse::ok(SessionView::from(&session))).into_response()
        }
        Err(e) => api_error(&e.to_string(), error_status(&e)).into_response(),
    }
}

/// GET /api/v1/upgrades
pub async fn list_upgrades(State(state): State<ApiState>) -> impl IntoResponse {
    match state.manager.list_sessions() {
        Ok(sessions) => {
            let views: Vec<SessionView> = sessions.iter().map(SessionView::from).collect();
            ApiResponse::ok(views).into_response()
        }
        Err(e) => api_error(&e.to_string(), error_status(&e)).into_response(),
    }
}

/// GET /api/v1/upgrades/:id
pub async fn get_upgrade(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.get_session(&id) {
        Ok(session) => ApiResponse::ok(SessionView::from(&session)).into_response(),
        Err(e) => api_error(&e.to_string(), error_status(&e)).into_response(),
    }
}

/// POST /api/v1/upgrades/:id/rollback
pub async fn rollback_upgrade(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.trigger_rollback(&id) {
        Ok(session) => ApiResponse::ok(SessionView::from(&session)).into_response(),
        Err(e) => api_error(&e.to_string(), error_status(&e)).into_response(),
    }
}

#[derive(serde::Deserialize)]
pub struct HistoryParams {
    pub agent_id: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /api/v1/upgrades/history?agent_id=&limit=&offset=
pub async fn upgrade_history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(50).min(500);
    let offset = params.offset.unwrap_or(0);
    match state.manager.history(&params.agent_id, limit, offset) {
        Ok(sessions) => {
            let views: Vec<SessionView> = sessions.iter().map(SessionView::from).collect();
            ApiResponse::ok(views).into_response()
        }
        Err(e) => api_error(&e.to_string(), error_status(&e)).into_response(),
    }
}

/// GET /api/v1/upgrades/:id/stream
///
/// Replays the session's event log, then tails the live broadcast until
/// the session task finishes and drops its sender. Finished sessions
/// get the replay only.
pub async fn stream_upgrade(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let (replay, live) = match state.manager.subscribe(&id) {
        Ok(pair) => pair,
        Err(e) => return api_error(&e.to_string(), error_status(&e)).into_response(),
    };
    debug!(session_id = %id, replayed = replay.len(), live = live.is_some(), "event stream opened");

    let last_replayed = replay.last().map(|e| e.seq);
    let replay = tokio_stream::iter(replay.into_iter().map(sse_event));
    let tail: Pin<Box<dyn Stream<Item = Event> + Send>> = match live {
        Some(rx) => Box::pin(
            BroadcastStream::new(rx)
                .filter_map(|res| res.ok())
                // The replay and the subscription overlap; drop duplicates.
                .filter(move |e| last_replayed.is_none_or(|n| e.seq > n))
                .map(sse_event),
        ),
        None => Box::pin(tokio_stream::empty()),
    };

    let stream = replay.chain(tail).map(Ok::<_, Infallible>);
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// GET /api/v1/versions
pub async fn list_versions(State(state): State<ApiState>) -> impl IntoResponse {
    match state.manager.list_versions() {
        Ok(versions) => ApiResponse::ok(versions).into_response(),
        Err(e) => api_error(&e.to_string(), error_status(&e)).into_response(),
    }
}

/// POST /api/v1/versions
pub async fn publish_version(
    State(state): State<ApiState>,
    Json(version): Json<AgentVersion>,
) -> impl IntoResponse {
    match state.manager.publish_version(&version) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(version)).into_response(),
        Err(e) => api_error(&e.to_string(), error_status(&e)).into_response(),
    }
}

fn sse_event(event: SessionEvent) -> Event {
    let id = event.seq.to_string();
    Event::default()
        .id(id)
        .json_data(&event)
        .unwrap_or_else(|_| Event::default().data("serialization error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use cutover_backup::{BackupManager, FileSnapshotSource};
    use cutover_health::{CheckFuture, CheckKind, CheckRunner, HealthProber};
    use cutover_session::{
        LogSink, OrchestratorConfig, SessionContext, SessionManager, SimFleet, StoreCatalog,
    };
    use cutover_state::{
        AgentVersion, CheckStatus, HealthCheck, StateStore, VersionLifecycle,
    };

    struct PassRunner;

    impl CheckRunner for PassRunner {
        fn run<'a>(&'a self, _agent_id: &'a str, check: CheckKind) -> CheckFuture<'a> {
            Box::pin(async move {
                Ok(HealthCheck {
                    name: check.name().to_string(),
                    status: CheckStatus::Pass,
                    message: "ok".to_string(),
                    metrics: HashMap::new(),
                    checked_at: 0,
                })
            })
        }
    }

    fn test_state() -> (ApiState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_version(&AgentVersion {
                version: "1.1.0".to_string(),
                size_bytes: 2048,
                release_notes: String::new(),
                lifecycle: VersionLifecycle::Recommended,
            })
            .unwrap();

        let fleet = SimFleet::new();
        fleet.register("agent-1", "1.0.0", 4);

        let agents_root = dir.path().join("agents");
        std::fs::create_dir_all(&agents_root).unwrap();
        std::fs::write(agents_root.join("agent-1"), b"state").unwrap();

        let backups = BackupManager::new(
            dir.path().join("backups"),
            store.clone(),
            Arc::new(FileSnapshotSource::new(&agents_root)),
        )
        .unwrap();

        let ctx = SessionContext {
            store: store.clone(),
            prober: Arc::new(HealthProber::new(Arc::new(PassRunner))),
            fleet,
            backups: Arc::new(backups),
            catalog: Arc::new(StoreCatalog::new(store)),
            notifier: Arc::new(LogSink),
        };
        let config = OrchestratorConfig {
            probe_interval: Duration::from_millis(10),
            verify_window: Duration::from_millis(40),
            max_session_duration: Duration::from_secs(25),
        };
        (
            ApiState {
                manager: SessionManager::new(ctx, config),
            },
            dir,
        )
    }

    fn blue_green_body() -> StartUpgradeRequest {
        StartUpgradeRequest {
            agent_ids: vec!["agent-1".to_string()],
            to_version: "1.1.0".to_string(),
            strategy: DeploymentStrategy::BlueGreen {
                validation_period_secs: 0,
                keep_old_version: false,
            },
        }
    }

    async fn wait_terminal(state: &ApiState, id: &str) {
        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                if state.manager.get_session(id).unwrap().is_terminal() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session did not finish");
    }

    #[tokio::test]
    async fn start_upgrade_returns_created() {
        let (state, _dir) = test_state();
        let resp = start_upgrade(State(state.clone()), Json(blue_green_body())).await;
        assert_eq!(resp.into_response().status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn start_upgrade_unknown_version_is_not_found() {
        let (state, _dir) = test_state();
        let mut body = blue_green_body();
        body.to_version = "9.9.9".to_string();
        let resp = start_upgrade(State(state), Json(body)).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_upgrade_bad_semver_is_bad_request() {
        let (state, _dir) = test_state();
        let mut body = blue_green_body();
        body.to_version = "latest".to_string();
        let resp = start_upgrade(State(state), Json(body)).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn concurrent_upgrade_for_same_agent_conflicts() {
        let (state, _dir) = test_state();
        let mut long = blue_green_body();
        long.strategy = DeploymentStrategy::BlueGreen {
            validation_period_secs: 3600,
            keep_old_version: false,
        };
        let resp = start_upgrade(State(state.clone()), Json(long)).await;
        assert_eq!(resp.into_response().status(), StatusCode::CREATED);

        let resp = start_upgrade(State(state), Json(blue_green_body())).await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn get_unknown_upgrade_is_not_found() {
        let (state, _dir) = test_state();
        let resp = get_upgrade(State(state), Path("session-0-0".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rollback_unknown_upgrade_is_not_found() {
        let (state, _dir) = test_state();
        let resp = rollback_upgrade(State(state), Path("session-0-0".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn history_lists_finished_sessions() {
        let (state, _dir) = test_state();
        let session = state
            .manager
            .start_upgrade(cutover_session::UpgradeRequest {
                agent_ids: vec!["agent-1".to_string()],
                to_version: "1.1.0".to_string(),
                strategy: DeploymentStrategy::BlueGreen {
                    validation_period_secs: 0,
                    keep_old_version: false,
                },
            })
            .await
            .unwrap();
        wait_terminal(&state, &session.id).await;

        let resp = upgrade_history(
            State(state),
            Query(HistoryParams {
                agent_id: "agent-1".to_string(),
                limit: None,
                offset: None,
            }),
        )
        .await;
        let resp = resp.into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["data"].as_array().unwrap().len(), 1);
        assert_eq!(parsed["data"][0]["state"], "success");
    }

    #[tokio::test]
    async fn stream_replays_a_finished_session() {
        let (state, _dir) = test_state();
        let session = state
            .manager
            .start_upgrade(cutover_session::UpgradeRequest {
                agent_ids: vec!["agent-1".to_string()],
                to_version: "1.1.0".to_string(),
                strategy: DeploymentStrategy::BlueGreen {
                    validation_period_secs: 0,
                    keep_old_version: false,
                },
            })
            .await
            .unwrap();
        wait_terminal(&state, &session.id).await;

        let resp = stream_upgrade(State(state), Path(session.id.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(axum::http::header::CONTENT_TYPE)
                .unwrap(),
            "text/event-stream"
        );
    }

    #[tokio::test]
    async fn publish_and_list_versions() {
        let (state, _dir) = test_state();
        let resp = publish_version(
            State(state.clone()),
            Json(AgentVersion {
                version: "1.2.0".to_string(),
                size_bytes: 4096,
                release_notes: "perf fixes".to_string(),
                lifecycle: VersionLifecycle::Available,
            }),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::CREATED);

        let resp = list_versions(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        // The seeded 1.1.0 plus the one just published.
        assert_eq!(parsed["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn publish_rejects_non_semver() {
        let (state, _dir) = test_state();
        let resp = publish_version(
            State(state),
            Json(AgentVersion {
                version: "nightly".to_string(),
                size_bytes: 0,
                release_notes: String::new(),
                lifecycle: VersionLifecycle::Available,
            }),
        )
        .await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_unknown_session_is_not_found() {
        let (state, _dir) = test_state();
        let resp = stream_upgrade(State(state), Path("session-0-0".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
