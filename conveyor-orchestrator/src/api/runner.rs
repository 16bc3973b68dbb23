//! Runner API Handlers
//!
//! HTTP endpoints for runner registration and administration.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use conveyor_core::domain::job::Job;
use conveyor_core::domain::runner::Runner;
use conveyor_core::dto::runner::{
    RegisterRunner, RegisterRunnerResponse, RunnerQuery, RunnerSummary, UpdateRunner,
};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

// =============================================================================
// Runner Registration
// =============================================================================

/// POST /api/runners/register
/// Register a runner with the orchestrator
pub async fn register_runner(
    State(state): State<AppState>,
    Json(req): Json<RegisterRunner>,
) -> ApiResult<(StatusCode, Json<RegisterRunnerResponse>)> {
    tracing::info!("Registering runner: {}", req.name);

    let res = state.dispatcher.runners().register(req).await?;

    Ok((StatusCode::CREATED, Json(res)))
}

// =============================================================================
// Runner Administration
// =============================================================================

/// GET /api/runners
/// List registered runners
pub async fn list_runners(
    State(state): State<AppState>,
    Query(query): Query<RunnerQuery>,
) -> ApiResult<Json<Vec<RunnerSummary>>> {
    tracing::debug!("Listing runners");

    Ok(Json(state.dispatcher.runners().list_runners(query).await?))
}

/// GET /api/runners/{id}
/// Get details for a specific runner
pub async fn get_runner(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Runner>> {
    tracing::debug!("Getting runner: {}", id);

    Ok(Json(state.dispatcher.runners().get_runner(id).await?))
}

/// PATCH /api/runners/{id}
/// Activate, deactivate or reassign a runner
pub async fn update_runner(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateRunner>,
) -> ApiResult<Json<Runner>> {
    let runner = state.dispatcher.runners().update_runner(id, req).await?;

    // Zone or type changes alter which jobs this runner filters on
    state.dispatcher.watermarks().invalidate();

    Ok(Json(runner))
}

/// DELETE /api/runners/{id}
/// Delete a runner registration
pub async fn delete_runner(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting runner: {}", id);

    state.dispatcher.runners().delete_runner(id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/runners/{id}/jobs
/// Jobs currently running on a runner
pub async fn running_jobs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.dispatcher.runners().running_jobs(id).await?))
}

/// GET /api/zones
/// Zones announced by globally registered runners
pub async fn known_zones(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.dispatcher.runners().known_zones().await?))
}
