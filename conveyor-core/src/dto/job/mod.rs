//! Job DTOs for inter-service communication

use serde::{Deserialize, Serialize};

use crate::domain::job::JobType;
use crate::domain::runner::RunnerInfo;
use crate::dto::runner::RunnerSettings;

/// Request from a producer to enqueue a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJob {
    pub job_type: JobType,
    pub project_id: i64,
    pub entity_id: i64,
    /// Falls back to the orchestrator's default zone when absent
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
}

/// Body of a runner poll
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequestParams {
    #[serde(default)]
    pub info: Option<RunnerInfo>,
}

/// Answer to a runner poll: at most one job, plus the capability settings
/// the runner should reconcile against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequestResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<DispatchedJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<RunnerSettings>,
}

/// A job as handed to a runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedJob {
    pub job_id: i64,
    pub job_type: JobType,
    /// Execution timeout in seconds
    pub timeout: u64,
    pub payload: serde_json::Value,
}

/// Per-job-type count of jobs waiting for a runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJobCount {
    pub job_type: JobType,
    pub count: i64,
}

/// Result of an artifact upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactUploaded {
    pub key: String,
    pub size: usize,
}

/// Query parameters of an artifact upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactUploadQuery {
    pub job_id: String,
    pub key: String,
}

/// Query parameters of an artifact download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDownloadQuery {
    pub key: String,
}

/// Accumulated usage of a project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectUsage {
    pub project_id: i64,
    pub job_count: i64,
    /// Total job execution time in milliseconds
    pub job_duration_ms: i64,
}
