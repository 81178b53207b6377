use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use flowcore_shared::{DataEvent, WorkflowRun};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::database;
use crate::error::{ApiResult, AppError};
use crate::AppState;

pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    if database::health_check(&state.db_pool).await {
        (StatusCode::OK, Json(json!({"status": "healthy", "service": "flowcore"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "service": "flowcore"})),
        )
    }
}

pub fn run_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_run))
        .route("/:id/cancel", post(cancel_run))
}

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", post(ingest_event))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowRun>> {
    let run = state.engine.store().get_run(id).await?;
    Ok(Json(run))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowRun>> {
    if !state.engine.cancel_run(id).await? {
        let run = state.engine.store().get_run(id).await?;
        return Err(AppError::Conflict(format!(
            "Run {} is already {:?}",
            id, run.status
        )));
    }

    let run = state.engine.store().get_run(id).await?;
    Ok(Json(run))
}

/// Accept a data event from an external data layer.
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<DataEvent>,
) -> ApiResult<StatusCode> {
    info!("Received {} event on {}", event.kind, event.model);
    state
        .events
        .send(event)
        .map_err(|_| AppError::InternalError("event dispatcher is not running".to_string()))?;
    Ok(StatusCode::ACCEPTED)
}
