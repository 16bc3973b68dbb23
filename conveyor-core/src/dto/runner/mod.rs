//! Runner DTOs
//!
//! Data transfer objects for runner-related operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::JobType;
use crate::domain::runner::{Runner, RunnerInfo};

/// Request to register a runner with the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunner {
    /// Human readable name for the runner
    pub name: String,

    /// Registration secret: the global registration token or a user access token
    pub token: String,

    #[serde(default)]
    pub info: RunnerInfo,
}

/// Capability settings the runner should apply locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSettings {
    pub job_type: JobType,
    pub concurrency: u32,
}

impl RunnerSettings {
    pub fn for_job_type(job_type: JobType) -> Self {
        Self {
            job_type,
            concurrency: job_type.recommended_concurrency(),
        }
    }
}

/// Answer to a successful registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunnerResponse {
    /// Bearer token for every subsequent call
    pub token: String,
    pub set: RunnerSettings,
}

/// Administrative changes to a runner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRunner {
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub zone: Option<String>,
}

/// Filters for listing runners
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerQuery {
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub zone: Option<String>,
    /// Contacted within the online window
    #[serde(default)]
    pub online: Option<bool>,
}

/// Summary information about a runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSummary {
    pub id: Uuid,

    pub name: String,

    pub job_type: JobType,

    pub zone: String,

    pub active: bool,

    /// Last time this runner called the orchestrator
    pub contacted_at: DateTime<Utc>,

    /// Number of jobs currently running on this runner
    pub running_jobs: usize,
}

impl RunnerSummary {
    pub fn new(runner: Runner, running_jobs: usize) -> Self {
        RunnerSummary {
            id: runner.id,
            name: runner.name,
            job_type: runner.job_type,
            zone: runner.zone,
            active: runner.active,
            contacted_at: runner.contacted_at,
            running_jobs,
        }
    }
}
