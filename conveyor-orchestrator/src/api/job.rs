//! Job API Handlers
//!
//! Runner protocol endpoints (poll, trace, artifacts) and job queries.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use conveyor_core::domain::job::Job;
use conveyor_core::dto::job::{
    ArtifactDownloadQuery, ArtifactUploadQuery, ArtifactUploaded, CreateJob, JobRequestParams,
    JobRequestResponse, PendingJobCount, ProjectUsage,
};
use conveyor_core::dto::trace::{JobTracePage, TraceQuery, UpdateJobTrace, UpdateJobTraceResponse};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::api::error::{ApiError, ApiResult};
use crate::api::{AppState, runner_token};

/// Body of `POST /api/jobs`: one job or a batch
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CreateJobsRequest {
    Batch(Vec<CreateJob>),
    Single(CreateJob),
}

// =============================================================================
// Runner Protocol
// =============================================================================

/// POST /api/jobs/request
/// Hand at most one pending job to the calling runner
pub async fn request_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<JobRequestParams>>,
) -> ApiResult<Json<JobRequestResponse>> {
    let info = body.and_then(|Json(params)| params.info);

    let res = state
        .dispatcher
        .request_job(runner_token(&headers), info)
        .await?;

    Ok(Json(res))
}

/// POST /api/jobs/trace
/// Append trace entries and report completion
pub async fn update_trace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateJobTrace>,
) -> ApiResult<Json<UpdateJobTraceResponse>> {
    tracing::debug!(
        "Trace update for job {} ({} entries, done: {})",
        req.job_id,
        req.trace.len(),
        req.done
    );

    let res = state
        .dispatcher
        .update_trace(runner_token(&headers), req)
        .await?;

    Ok(Json(res))
}

/// POST /api/jobs/artifacts?jobId=&key=
/// Store an artifact of the runner's current job
pub async fn upload_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ArtifactUploadQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ArtifactUploaded>)> {
    let res = state
        .dispatcher
        .upload_artifact(runner_token(&headers), &query.job_id, &query.key, body.to_vec())
        .await?;

    Ok((StatusCode::CREATED, Json(res)))
}

/// GET /api/jobs/artifacts?key=
/// Stream a stored artifact
pub async fn download_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ArtifactDownloadQuery>,
) -> ApiResult<Response> {
    let reader = state
        .dispatcher
        .download_artifact(runner_token(&headers), &query.key)
        .await?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

// =============================================================================
// Job Endpoints
// =============================================================================

/// POST /api/jobs
/// Create one job or a batch of jobs
pub async fn create_jobs(
    State(state): State<AppState>,
    Json(req): Json<CreateJobsRequest>,
) -> ApiResult<(StatusCode, Json<Vec<Job>>)> {
    let reqs = match req {
        CreateJobsRequest::Batch(reqs) => reqs,
        CreateJobsRequest::Single(req) => vec![req],
    };
    let requested = reqs.len();

    let jobs = state.dispatcher.jobs().create_jobs(reqs).await;
    if jobs.is_empty() && requested > 0 {
        return Err(ApiError::BadRequest("no job could be created".to_string()));
    }

    Ok((StatusCode::CREATED, Json(jobs)))
}

/// GET /api/jobs/pending
/// Pending job count per job type
pub async fn pending_counts(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<PendingJobCount>>> {
    Ok(Json(state.dispatcher.jobs().pending_counts().await?))
}

/// GET /api/jobs/{id}
/// Get job details by ID
pub async fn get_job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Job>> {
    tracing::debug!("Getting job: {}", id);

    Ok(Json(state.dispatcher.jobs().get_job(id).await?))
}

/// GET /api/jobs/{id}/trace?after=
/// Read the job trace from a position
pub async fn get_trace(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<TraceQuery>,
) -> ApiResult<Json<JobTracePage>> {
    let jobs = state.dispatcher.jobs();
    let job = jobs.get_job(id).await?;

    Ok(Json(jobs.traces().get_trace(&job, query.after).await?))
}

/// POST /api/jobs/{id}/cancel
/// Cancel a job that has not finished
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Job>> {
    tracing::info!("Canceling job: {}", id);

    Ok(Json(state.dispatcher.jobs().cancel_job(id).await?))
}

/// GET /api/projects/{id}/usage
/// Accumulated job usage of a project
pub async fn project_usage(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProjectUsage>> {
    Ok(Json(state.dispatcher.jobs().project_usage(id).await?))
}
