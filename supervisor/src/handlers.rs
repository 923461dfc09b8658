use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use common::client::AllocateRequest;
use common::job::CompactionRequest;
use common::report::{ReportAck, SubTaskReport};
use common::{
    DataSegment, IngestError, IngestionSpec, JobInfo, JobStatus, SegmentId, TaskKind,
    TaskStatusCode,
};

use crate::job::IngestionJob;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/compactions", post(create_compaction))
        .route("/api/v1/datasources/:ds/segments", get(list_segments))
        .route("/api/v1/supervisors/:id/segments/allocate", post(allocate_segment))
        .route("/api/v1/supervisors/:id/reports", post(report))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

pub struct ApiError(IngestError);

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Error atendiendo request: {}", self.0);
        }
        let body = json!({ "error": self.0.to_string(), "code": self.0.code() });
        (status, Json(body)).into_response()
    }
}

fn status_for(err: &IngestError) -> StatusCode {
    match err {
        IngestError::SupervisorNotFound(_) | IngestError::UnknownTask(_) => StatusCode::NOT_FOUND,
        e if e.is_consistency_violation() => StatusCode::CONFLICT,
        IngestError::AllocationNotSupported { .. }
        | IngestError::NotASupervisor { .. }
        | IngestError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
        IngestError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Registra el job y lo corre en segundo plano
async fn create_job(
    State(state): State<AppState>,
    Json(spec): Json<IngestionSpec>,
) -> ApiResult<JobInfo> {
    spec.validate()?;
    let id = format!(
        "{}_{}_{}",
        TaskKind::Supervisor.as_str(),
        spec.datasource,
        Uuid::new_v4().simple()
    );
    let datasource = spec.datasource.clone();
    let job = IngestionJob::ingest(&id, spec, state.env());
    let info = state.register_job(&id, &datasource, job.runner().clone())?;
    info!(job_id = %id, datasource = %datasource, "Job de ingesta aceptado");

    spawn_job(state, job);
    Ok(Json(info))
}

async fn create_compaction(
    State(state): State<AppState>,
    Json(request): Json<CompactionRequest>,
) -> ApiResult<JobInfo> {
    if request.datasource.trim().is_empty() {
        return Err(IngestError::InvalidSpec("datasource vacío".to_string()).into());
    }
    let id = format!(
        "{}_{}_{}",
        TaskKind::Compaction.as_str(),
        request.datasource,
        Uuid::new_v4().simple()
    );
    let datasource = request.datasource.clone();
    let job = IngestionJob::compact(&id, request, state.env());
    let info = state.register_job(&id, &datasource, job.runner().clone())?;
    info!(job_id = %id, datasource = %datasource, "Compactación aceptada");

    spawn_job(state, job);
    Ok(Json(info))
}

fn spawn_job(state: AppState, job: IngestionJob) {
    tokio::spawn(async move {
        let id = job.id().to_string();
        if let Err(e) = job.start() {
            state.finish_job(&id, |info| {
                info.status = JobStatus::Failed;
                info.error = Some(e.to_string());
                info.finished_at = Some(Utc::now());
            });
            return;
        }
        state.update_job(&id, |info| info.status = JobStatus::Running);

        let outcome = job.wait().await;
        state.finish_job(&id, |info| {
            info.finished_at = Some(Utc::now());
            match &outcome.status {
                TaskStatusCode::Success => info.status = JobStatus::Succeeded,
                TaskStatusCode::Failed(message) => {
                    info.status = JobStatus::Failed;
                    info.error = Some(message.clone());
                }
                TaskStatusCode::Cancelled => {
                    info.status = JobStatus::Failed;
                    info.error = Some("job cancelado".to_string());
                }
            }
            info.report = Some(outcome.report.clone());
        });
    });
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<JobInfo> {
    state
        .job(&id)
        .map(Json)
        .ok_or_else(|| ApiError(IngestError::UnknownTask(id)))
}

async fn list_segments(
    State(state): State<AppState>,
    Path(ds): Path<String>,
) -> ApiResult<Vec<DataSegment>> {
    Ok(Json(state.catalog.fetch_used_segments(&ds, &[])?))
}

/* ---------------- RPC de las sub-tareas ---------------- */

async fn allocate_segment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AllocateRequest>,
) -> ApiResult<SegmentId> {
    let endpoint = state.runner_for(&id)?.find_supervisor(&id)?;
    let segment = match &req.sequence_name {
        Some(sequence_name) => endpoint.allocate_segment_for_sequence(
            req.timestamp,
            sequence_name,
            req.previous_segment_id.as_deref(),
        )?,
        None => endpoint.allocate_segment(req.timestamp)?,
    };
    Ok(Json(segment))
}

async fn report(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<SubTaskReport>,
) -> ApiResult<ReportAck> {
    let endpoint = state.runner_for(&id)?.find_supervisor(&id)?;
    Ok(Json(endpoint.report(report)?))
}
