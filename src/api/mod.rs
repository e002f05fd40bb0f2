use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::MirrorError;
use crate::mirror::SupervisorHandle;

pub fn routes() -> Router<SupervisorHandle> {
    Router::new()
        .route(
            "/backups",
            get(list_backups).post(add_backup).delete(remove_backup),
        )
        .route("/restore", post(restore))
        .route("/logs", get(get_logs))
}

/// Build the full application router around a running supervisor.
pub fn app(supervisor: SupervisorHandle) -> Router {
    Router::new()
        .nest("/api", routes())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(supervisor)
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PairRequest {
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    limit: Option<usize>,
}

/// `MirrorError` as an HTTP response with a `{"error": ...}` body.
pub struct ApiError(MirrorError);

impl From<MirrorError> for ApiError {
    fn from(err: MirrorError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MirrorError::NotFound => StatusCode::NOT_FOUND,
            MirrorError::AlreadyExists { .. } => StatusCode::CONFLICT,
            MirrorError::BackupCapacity { .. } => StatusCode::TOO_MANY_REQUESTS,
            MirrorError::SupervisorGone => StatusCode::SERVICE_UNAVAILABLE,
            e if e.is_rejection() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

async fn list_backups(State(supervisor): State<SupervisorHandle>) -> Result<Json<serde_json::Value>, ApiError> {
    let groups = supervisor.list().await?;
    Ok(Json(serde_json::json!({"backups": groups})))
}

async fn add_backup(
    State(supervisor): State<SupervisorHandle>,
    Json(req): Json<PairRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let worker = supervisor.add(req.source, req.target).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"status": "started", "worker": worker})),
    ))
}

async fn remove_backup(
    State(supervisor): State<SupervisorHandle>,
    Json(req): Json<PairRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let exit = supervisor.remove(req.source, req.target).await?;
    Ok(Json(serde_json::json!({"status": "ended", "exit": exit})))
}

async fn restore(
    State(supervisor): State<SupervisorHandle>,
    Json(req): Json<PairRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = supervisor.restore(req.source, req.target).await?;
    Ok(Json(serde_json::json!({"status": "complete", "report": report})))
}

async fn get_logs(
    State(supervisor): State<SupervisorHandle>,
    Query(query): Query<LogsQuery>,
) -> Json<serde_json::Value> {
    let logs = supervisor.logs().get_logs(query.limit);
    Json(serde_json::json!({"logs": logs}))
}
