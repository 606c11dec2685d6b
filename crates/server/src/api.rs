// HTTP routes for one background process
//
// /wake is what HttpWakeTransport calls: the health check and every run that
// spends its budget land here. The other routes are the control surface.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use batchrun_engine::{BackgroundProcess, ProcessError, WakeNonce};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// App state shared by the routes
#[derive(Clone)]
pub struct AppState {
    pub process: Arc<BackgroundProcess>,
    pub nonces: WakeNonce,
}

impl AppState {
    pub fn new(process: Arc<BackgroundProcess>, nonces: WakeNonce) -> Self {
        Self { process, nonces }
    }
}

/// Create all routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/wake/:process", post(wake))
        .route("/tasks", post(add_tasks))
        .route("/cancel", post(cancel))
        .route("/touch", post(touch))
        .route("/status", get(status))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct WakeParams {
    #[serde(default)]
    pub nonce: String,
}

#[derive(Debug, Deserialize)]
pub struct TouchParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddTasksResponse {
    pub batches: usize,
    pub tasks: usize,
    /// False when the wake-up failed; the health check resumes the queue
    pub woken: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TouchResponse {
    pub woken: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Counts {
    pub total: u64,
    pub completed: u64,
    pub left: u64,
    pub progress: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub process: String,
    pub running: bool,
    pub aborting: bool,
    pub empty_queue: bool,
    pub in_progress: bool,
    pub health_check_scheduled: bool,
    pub started_at: Option<String>,
    pub tasks: Counts,
    pub batches: Counts,
}

fn internal_error(e: ProcessError) -> StatusCode {
    error!(error = %e, "process operation failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /wake/{process}?nonce= - Start a run in the background
async fn wake(
    State(state): State<AppState>,
    Path(process): Path<String>,
    Query(params): Query<WakeParams>,
) -> StatusCode {
    if process != state.process.name() {
        return StatusCode::NOT_FOUND;
    }

    if !state
        .nonces
        .verify(&process, &params.nonce, chrono::Utc::now())
    {
        warn!(%process, "rejected wake-up with a bad nonce");
        return StatusCode::FORBIDDEN;
    }

    let process = state.process.clone();
    tokio::spawn(async move {
        match process.maybe_handle().await {
            Ok(outcome) => debug!(?outcome, "wake-up handled"),
            Err(e) => warn!(error = %e, "wake-up failed"),
        }
    });

    StatusCode::ACCEPTED
}

/// POST /tasks - Append a JSON array of workloads and wake the process
async fn add_tasks(
    State(state): State<AppState>,
    Json(tasks): Json<Vec<Value>>,
) -> Result<(StatusCode, Json<AddTasksResponse>), StatusCode> {
    if tasks.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let count = tasks.len();
    let batches = state
        .process
        .add_tasks(tasks)
        .await
        .map_err(internal_error)?;

    let woken = match state.process.run().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "wake-up after adding tasks failed");
            false
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(AddTasksResponse {
            batches: batches.count(),
            tasks: count,
            woken,
        }),
    ))
}

/// POST /cancel - Cancel the queue, or flag the active run to stop
async fn cancel(State(state): State<AppState>) -> Result<Json<StatusResponse>, StatusCode> {
    state.process.cancel().await.map_err(internal_error)?;
    info!(process = %state.process.name(), "cancel requested over http");
    collect_status(&state.process)
        .await
        .map(Json)
        .map_err(internal_error)
}

/// POST /touch?force= - Restart a stalled process
async fn touch(
    State(state): State<AppState>,
    Query(params): Query<TouchParams>,
) -> Result<Json<TouchResponse>, StatusCode> {
    let woken = state
        .process
        .touch(params.force)
        .await
        .map_err(internal_error)?;
    Ok(Json(TouchResponse { woken }))
}

/// GET /status
async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, StatusCode> {
    collect_status(&state.process)
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn collect_status(process: &BackgroundProcess) -> Result<StatusResponse, ProcessError> {
    Ok(StatusResponse {
        process: process.name().to_string(),
        running: process.is_running().await?,
        aborting: process.is_aborting().await?,
        empty_queue: process.is_empty_queue().await?,
        in_progress: process.is_in_progress().await?,
        health_check_scheduled: process.is_health_check_scheduled(),
        started_at: process.start_time(true).await?.map(|t| t.to_rfc3339()),
        tasks: Counts {
            total: process.tasks_count().await?,
            completed: process.tasks_completed().await?,
            left: process.tasks_left().await?,
            progress: process.tasks_progress(2).await?,
        },
        batches: Counts {
            total: process.batches_count().await?,
            completed: process.batches_completed().await?,
            left: process.batches_left().await?,
            progress: process.batches_progress(2).await?,
        },
    })
}
