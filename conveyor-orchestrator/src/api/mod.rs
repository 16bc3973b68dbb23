//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod job;
pub mod runner;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderMap,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::service::Dispatcher;

/// Header carrying the runner bearer token
pub const RUNNER_TOKEN_HEADER: &str = "x-runner-token";

/// Largest accepted artifact upload
const MAX_ARTIFACT_BYTES: usize = 256 * 1024 * 1024;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

/// Runner token from the request headers, empty when absent
pub(crate) fn runner_token(headers: &HeaderMap) -> &str {
    headers
        .get(RUNNER_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and operations
        .route("/health", get(health::health_check))
        .route("/api/metrics", get(health::metrics))
        .route(
            "/api/maintenance",
            get(health::get_maintenance).put(health::set_maintenance),
        )
        // Runner protocol
        .route("/api/runners/register", post(runner::register_runner))
        .route("/api/jobs/request", post(job::request_job))
        .route("/api/jobs/trace", post(job::update_trace))
        .route(
            "/api/jobs/artifacts",
            post(job::upload_artifact)
                .get(job::download_artifact)
                .layer(DefaultBodyLimit::max(MAX_ARTIFACT_BYTES)),
        )
        // Job endpoints
        .route("/api/jobs", post(job::create_jobs))
        .route("/api/jobs/pending", get(job::pending_counts))
        .route("/api/jobs/{id}", get(job::get_job))
        .route("/api/jobs/{id}/trace", get(job::get_trace))
        .route("/api/jobs/{id}/cancel", post(job::cancel_job))
        .route("/api/projects/{id}/usage", get(job::project_usage))
        // Runner administration
        .route("/api/runners", get(runner::list_runners))
        .route(
            "/api/runners/{id}",
            get(runner::get_runner)
                .patch(runner::update_runner)
                .delete(runner::delete_runner),
        )
        .route("/api/runners/{id}/jobs", get(runner::running_jobs))
        .route("/api/zones", get(runner::known_zones))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
