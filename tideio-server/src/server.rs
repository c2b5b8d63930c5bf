use crate::config::Config;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tideio_core::{
    ContainerMode, ContainerTids, Dispatcher, ObjectFilter, TideError, TransId, TransStatus,
};
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(message: String) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(message),
        })
    }
}

fn status_of(err: &TideError) -> StatusCode {
    match err {
        TideError::NotFound(_) => StatusCode::NOT_FOUND,
        TideError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        TideError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        TideError::StateConflict(_) | TideError::NotEmpty(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: TideError) -> Response {
    (status_of(&err), ApiResponse::<()>::err(err.to_string())).into_response()
}

pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(&config.dispatcher_config())?;
    let state = Arc::new(ServerState { dispatcher });

    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;

    state.dispatcher.shutdown();
    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/containers/:name/tids", get(container_tids))
        .route("/containers/:name/trans/:tid", get(trans_status))
        .route("/containers/:name/objects", get(list_objects))
        .route("/containers/:name/snapshots", post(create_snapshot))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn container_tids(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Response {
    match with_container(&state, &name, ContainerMode::ReadOnly, |d, c| {
        d.container_query_tids(c)
    }) {
        Ok(tids) => ApiResponse::<ContainerTids>::ok(tids).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Serialize)]
struct TransStatusResponse {
    tid: TransId,
    status: TransStatus,
}

async fn trans_status(
    State(state): State<Arc<ServerState>>,
    Path((name, tid)): Path<(String, TransId)>,
) -> Response {
    match with_container(&state, &name, ContainerMode::ReadOnly, |d, c| {
        d.trans_query(c, tid)
    }) {
        Ok(status) => ApiResponse::ok(TransStatusResponse { tid, status }).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ListObjectsQuery {
    tid: TransId,
    #[serde(default)]
    offset: u64,
    #[serde(default = "default_limit")]
    limit: u64,
}

fn default_limit() -> u64 {
    100
}

#[derive(Debug, Serialize)]
struct ObjectRow {
    id: String,
    kind: String,
    name: Option<String>,
}

async fn list_objects(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Query(query): Query<ListObjectsQuery>,
) -> Response {
    let result = with_container(&state, &name, ContainerMode::ReadOnly, |d, c| {
        d.container_list_obj(c, query.tid, ObjectFilter::Any, query.offset, query.limit)
    });
    match result {
        Ok(entries) => {
            let rows: Vec<ObjectRow> = entries
                .into_iter()
                .map(|e| ObjectRow {
                    id: e.id.to_string(),
                    kind: format!("{:?}", e.kind),
                    name: e.name,
                })
                .collect();
            ApiResponse::ok(rows).into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotRequest {
    name: String,
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    name: String,
    tid: TransId,
}

async fn create_snapshot(
    State(state): State<Arc<ServerState>>,
    Path(container): Path<String>,
    Json(request): Json<SnapshotRequest>,
) -> Response {
    let dispatcher = &state.dispatcher;
    let cookie = match dispatcher.container_open(&container, ContainerMode::ReadWrite, false) {
        Ok(cookie) => cookie,
        Err(err) => return error_response(err),
    };
    let result = dispatcher.container_snapshot(cookie, &request.name).await;
    let _ = dispatcher.container_close(cookie);
    match result {
        Ok(tid) => ApiResponse::ok(SnapshotResponse {
            name: request.name,
            tid,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

/// Open the container for the duration of one admin request.
fn with_container<T>(
    state: &Arc<ServerState>,
    name: &str,
    mode: ContainerMode,
    f: impl FnOnce(&Dispatcher, tideio_core::Cookie) -> tideio_core::Result<T>,
) -> tideio_core::Result<T> {
    let dispatcher = &state.dispatcher;
    let cookie = dispatcher.container_open(name, mode, false)?;
    let result = f(dispatcher, cookie);
    let _ = dispatcher.container_close(cookie);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tideio_core::DispatcherConfig;
    use tower::ServiceExt;

    fn state(dir: &tempfile::TempDir) -> Arc<ServerState> {
        let dispatcher = Dispatcher::new(&DispatcherConfig::new(dir.path())).unwrap();
        Arc::new(ServerState { dispatcher })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_container_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/containers/missing/tids")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
