//! REST handlers for the job registry, scheduler and execution tracker.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use dts_client::wire::{
    CreatedJob, ErrorBody, ExecutionList, JobList, ListQuery, RunList, RunNowRequest,
};
use dts_client::{ExecutionTracker, JobRegistry, Scheduler, ServiceError};
use dts_types::{
    Execution, ExecutionOutcome, Job, JobPatch, JobSpec, NewScheduledRun, ScheduledRun,
};

use crate::ServerState;

/// A service error rendered as `{kind, message, from?, to?}`.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = ErrorBody::from_service_error(&self.0);
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self.0);
        }
        (status, Json(body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

impl From<dts_storage::StorageError> for ApiError {
    fn from(err: dts_storage::StorageError) -> Self {
        ApiError(err.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(ServiceError::Rejected(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(ServiceError::Rejected(rejection.body_text()))
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ─── Job registry ────────────────────────────────────────

/// GET /v1/jobs?status=
pub async fn list_jobs(
    State(state): State<Arc<ServerState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<JobList>> {
    let Query(query) = query?;
    let jobs = state.backend.list_jobs(query.status).await?;
    Ok(Json(JobList { jobs }))
}

/// POST /v1/jobs
pub async fn create_job(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<JobSpec>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreatedJob>)> {
    let Json(spec) = payload?;
    let job_id = JobRegistry::create_job(&state.backend, &spec).await?;
    Ok((StatusCode::CREATED, Json(CreatedJob { job_id })))
}

/// GET /v1/jobs/{id}
pub async fn get_job(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.backend.get_job(&id).await?))
}

/// PUT /v1/jobs/{id}
pub async fn update_job(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    payload: Result<Json<JobPatch>, JsonRejection>,
) -> ApiResult<Json<Job>> {
    let Json(patch) = payload?;
    Ok(Json(state.backend.update_job(&id, &patch).await?))
}

/// DELETE /v1/jobs/{id}
pub async fn delete_job(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.backend.delete_job(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.backend.cancel_job(&id).await?))
}

// ─── Scheduler ───────────────────────────────────────────

/// GET /v1/scheduled-runs?job_id=
pub async fn list_scheduled_runs(
    State(state): State<Arc<ServerState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<RunList>> {
    let Query(query) = query?;
    let runs = state
        .backend
        .list_scheduled_runs(query.job_id.as_deref())
        .await?;
    Ok(Json(RunList { runs }))
}

/// POST /v1/scheduled-runs
pub async fn create_scheduled_run(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<NewScheduledRun>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ScheduledRun>)> {
    let Json(request) = payload?;
    let run = state.backend.create_scheduled_run(&request).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /v1/scheduled-runs/{id}
pub async fn get_scheduled_run(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ScheduledRun>> {
    Ok(Json(state.backend.storage().get_scheduled_run(&id).await?))
}

/// DELETE /v1/scheduled-runs/{id}. 204 even when the run is already gone.
pub async fn cancel_scheduled_run(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.backend.cancel_scheduled_run(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/scheduled-runs/run-now
pub async fn run_now(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<RunNowRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Execution>)> {
    let Json(request) = payload?;
    let execution = state
        .backend
        .run_now(&request.job_id, request.resource_requirements)
        .await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

// ─── Execution tracker ───────────────────────────────────

/// GET /v1/executions?job_id=
pub async fn list_executions(
    State(state): State<Arc<ServerState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<ExecutionList>> {
    let Query(query) = query?;
    let job_id = query
        .job_id
        .ok_or_else(|| ServiceError::Rejected("job_id query parameter is required".into()))?;
    let executions = state.backend.list_executions(&job_id).await?;
    Ok(Json(ExecutionList { executions }))
}

/// GET /v1/executions/{id}
pub async fn get_execution(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Execution>> {
    Ok(Json(state.backend.storage().get_execution(&id).await?))
}

/// POST /v1/executions/{id}/finish
pub async fn finish_execution(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    payload: Result<Json<ExecutionOutcome>, JsonRejection>,
) -> ApiResult<Json<Execution>> {
    let Json(outcome) = payload?;
    Ok(Json(state.backend.finish_execution(&id, &outcome).await?))
}
