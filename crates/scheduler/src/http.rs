//! HTTP surface
//!
//! Worker-facing routes under `/worker` and `/task`, client-facing routes
//! under `/api`, plus `/health` and `/metrics`.

use crate::scheduler::Scheduler;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use promptloop_common::{PromptLoopError, METRICS};
use promptloop_proto::{
    Ack, CancelResponse, CompleteTaskRequest, EnqueueRequest, EnqueueResponse, FailTaskRequest,
    HeartbeatRequest, NotFound, QueueStats, RegisterWorkerRequest, TaskId, Worker,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

/// Error wrapper rendering `{error}` with the mapped status code
#[derive(Debug)]
pub struct ApiError(pub PromptLoopError);

impl From<PromptLoopError> for ApiError {
    fn from(err: PromptLoopError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        } else {
            debug!("Request rejected: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the scheduler router
pub fn router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/worker/register", post(register_worker))
        .route("/worker/{id}/task", get(poll_task))
        .route("/worker/{id}/heartbeat", post(heartbeat))
        .route("/worker/{id}", delete(deregister_worker))
        .route("/task/{id}/complete", post(complete_task))
        .route("/task/{id}/error", post(fail_task))
        .route("/api/enqueue", post(enqueue))
        .route("/api/status/{id}", get(task_status))
        .route("/api/cancel/{id}", post(cancel_task))
        .route("/api/stats", get(queue_stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(AppState { scheduler })
}

fn parse_task_id(raw: &str) -> ApiResult<TaskId> {
    TaskId::parse_str(raw)
        .map_err(|_| ApiError(PromptLoopError::not_found(format!("task {}", raw))))
}

async fn register_worker(
    State(state): State<AppState>,
    Json(request): Json<RegisterWorkerRequest>,
) -> ApiResult<Json<Worker>> {
    let worker = state
        .scheduler
        .register_worker(&request.worker_id, request.capabilities)?;
    Ok(Json(worker))
}

async fn poll_task(State(state): State<AppState>, Path(worker_id): Path<String>) -> Response {
    match state.scheduler.assign_task(&worker_id).await {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<Ack>> {
    if state
        .scheduler
        .heartbeat(&worker_id, request.status, request.current_stats)
    {
        Ok(Json(Ack::ok()))
    } else {
        Err(PromptLoopError::not_found(format!("worker {}", worker_id)).into())
    }
}

async fn deregister_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> ApiResult<Json<Ack>> {
    if state.scheduler.deregister_worker(&worker_id).await {
        Ok(Json(Ack::ok()))
    } else {
        Err(PromptLoopError::not_found(format!("worker {}", worker_id)).into())
    }
}

async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<CompleteTaskRequest>,
) -> ApiResult<Json<Ack>> {
    let task_id = parse_task_id(&task_id)?;
    let outcome = state
        .scheduler
        .complete_task(&task_id, request.worker_id.as_deref(), request.result)
        .await
        .into_result(&task_id)?;
    Ok(Json(Ack::with_outcome(true, outcome.as_str())))
}

async fn fail_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<FailTaskRequest>,
) -> ApiResult<Json<Ack>> {
    let task_id = parse_task_id(&task_id)?;
    let outcome = state
        .scheduler
        .fail_task(&task_id, request.worker_id.as_deref(), request.error)
        .await
        .into_result(&task_id)?;
    Ok(Json(Ack::with_outcome(true, outcome.as_str())))
}

async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Json<EnqueueResponse> {
    let task_id = state.scheduler.enqueue(request).await;
    Json(EnqueueResponse { task_id })
}

async fn task_status(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let task = TaskId::parse_str(&task_id)
        .ok()
        .and_then(|id| state.scheduler.get_status(&id));

    match task {
        Some(task) => Json(task).into_response(),
        None => (StatusCode::NOT_FOUND, Json(NotFound::new())).into_response(),
    }
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Json<CancelResponse> {
    let cancelled = match TaskId::parse_str(&task_id) {
        Ok(id) => state.scheduler.cancel(&id).await,
        Err(_) => false,
    };
    Json(CancelResponse { cancelled })
}

async fn queue_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.scheduler.queue_stats())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics() -> ApiResult<Response> {
    let body = METRICS.gather()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
