//! Health Check API Handler
//!
//! Health, metrics and maintenance endpoints for operators.

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Maintenance {
    pub enabled: bool,
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /api/metrics
/// Prometheus text exposition
pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let body = state
        .dispatcher
        .metrics()
        .render()
        .map_err(|e| ApiError::InternalError(format!("Failed to encode metrics: {e}")))?;

    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}

/// GET /api/maintenance
pub async fn get_maintenance(State(state): State<AppState>) -> Json<Maintenance> {
    Json(Maintenance {
        enabled: state.dispatcher.in_maintenance(),
    })
}

/// PUT /api/maintenance
/// While enabled, job requests are answered without a job
pub async fn set_maintenance(
    State(state): State<AppState>,
    Json(req): Json<Maintenance>,
) -> Json<Maintenance> {
    state.dispatcher.set_maintenance(req.enabled);
    Json(req)
}
