use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::dispatch::{DispatchCoordinator, JobView, NodeRun, OutputGap, Quorum};
use crate::error::DispatchError;

#[derive(Clone)]
pub struct DashboardState {
    pub coordinator: Arc<DispatchCoordinator>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub node_name: String,
    pub status: String,
    pub ack_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_status: Option<i32>,
    pub output: String,
    pub error_output: String,
    pub error: Option<String>,
    pub gaps: Vec<OutputGap>,
}

impl From<&NodeRun> for RunResponse {
    fn from(run: &NodeRun) -> Self {
        Self {
            node_name: run.node_name.clone(),
            status: run.status.to_string(),
            ack_time: run.ack_time,
            end_time: run.end_time,
            exit_status: run.exit_status,
            output: String::from_utf8_lossy(&run.output).into_owned(),
            error_output: String::from_utf8_lossy(&run.error_output).into_owned(),
            error: run.error.clone(),
            gaps: run.gaps.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub command: String,
    pub status: String,
    pub quorum_spec: String,
    pub quorum: usize,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub persistence_degraded: bool,
    pub runs: Vec<RunResponse>,
}

impl From<&JobView> for JobResponse {
    fn from(view: &JobView) -> Self {
        let job = &view.job;
        Self {
            id: job.id.to_string(),
            command: job.command.clone(),
            status: job.status.to_string(),
            quorum_spec: job.quorum_spec.to_string(),
            quorum: job.quorum,
            timeout_ms: job.timeout.as_millis() as u64,
            created_at: job.created_at,
            updated_at: job.updated_at,
            persistence_degraded: view.persistence_degraded,
            runs: view.runs.iter().map(RunResponse::from).collect(),
        }
    }
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    command: String,
    node_names: Vec<String>,
    /// Defaults to every node.
    quorum: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job_id: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize, Default)]
struct CancelJobRequest {
    #[serde(default)]
    node_names: Vec<String>,
}

#[derive(Serialize)]
struct CancelJobResponse {
    cancelled_nodes: Vec<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn status_code(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        DispatchError::JobNotFound(_) | DispatchError::RunNotFound { .. } => StatusCode::NOT_FOUND,
        DispatchError::StorageFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: DispatchError) -> ApiError {
    (
        status_code(&err),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| error_response(DispatchError::invalid(format!("invalid job id {raw:?}"))))
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/:id", get(job_status_handler))
        .route("/api/jobs/:id/cancel", post(cancel_job_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .coordinator
        .list()
        .await
        .iter()
        .map(JobResponse::from)
        .collect();

    Json(jobs)
}

async fn job_status_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job_id = parse_job_id(&id)?;
    state
        .coordinator
        .status(job_id)
        .await
        .map(|view| Json(JobResponse::from(&view)))
        .map_err(error_response)
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    let quorum = match payload.quorum.as_deref() {
        None => Ok(Quorum::all()),
        Some(raw) => raw.parse::<Quorum>(),
    };
    let result = match quorum {
        Ok(quorum) => {
            state
                .coordinator
                .submit(
                    payload.command,
                    payload.node_names,
                    quorum,
                    payload.timeout_ms.map(Duration::from_millis),
                )
                .await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(job_id) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job_id.to_string()),
                error: None,
            }),
        ),
        Err(e) => (
            status_code(&e),
            Json(SubmitJobResponse {
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn cancel_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
    payload: Option<Json<CancelJobRequest>>,
) -> Result<Json<CancelJobResponse>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let request = payload.map(|Json(r)| r).unwrap_or_default();

    let cancelled = if request.node_names.is_empty() {
        state.coordinator.cancel(job_id).await
    } else {
        state
            .coordinator
            .cancel_runs(job_id, &request.node_names)
            .await
    };
    cancelled
        .map(|cancelled_nodes| Json(CancelJobResponse { cancelled_nodes }))
        .map_err(error_response)
}
