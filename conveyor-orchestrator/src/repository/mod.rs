//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository trait covers one domain entity; `JobStore` is the union the
//! services depend on. Postgres backs production deployments, the in-memory
//! store backs tests and database-less runs.

pub mod job;
pub mod memory;
pub mod runner;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::job::{Job, JobStatus, JobType};
use conveyor_core::domain::runner::Runner;
use conveyor_core::dto::job::ProjectUsage;
use thiserror::Error;
use uuid::Uuid;

pub use job::PgStore;
pub use memory::MemoryStore;

/// Repository error type
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A job to be inserted; id, iid and timestamps are assigned by the store
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub project_id: i64,
    pub entity_id: i64,
    pub zone: String,
    pub extra: Option<serde_json::Value>,
}

/// Eligible-jobs query
///
/// Always restricted to `Pending` jobs, ordered by ascending id.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFilter {
    /// Exact zone match, `None` for any zone
    pub zone: Option<String>,
    /// Allowed job types, `None` for any type
    pub job_types: Option<Vec<JobType>>,
    /// Only ids strictly greater than this
    pub after_id: Option<i64>,
    pub limit: usize,
}

impl JobFilter {
    pub fn matches(&self, job_id: i64, job_type: JobType, zone: &str) -> bool {
        self.zone.as_deref().is_none_or(|z| z == zone)
            && self
                .job_types
                .as_ref()
                .is_none_or(|types| types.contains(&job_type))
            && self.after_id.is_none_or(|after| job_id > after)
    }
}

/// Terminal update of a running job
#[derive(Debug, Clone, Copy)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub duration_ms: i64,
    pub ended_at: DateTime<Utc>,
}

/// Runner listing filter
#[derive(Debug, Clone, Default)]
pub struct RunnerFilter {
    pub job_type: Option<JobType>,
    pub active: Option<bool>,
    pub zone: Option<String>,
    /// `Some(true)`: contacted after the deadline; `Some(false)`: at or before it
    pub online_since: Option<(bool, DateTime<Utc>)>,
}

impl RunnerFilter {
    pub fn matches(&self, runner: &Runner) -> bool {
        self.job_type.is_none_or(|t| t == runner.job_type)
            && self.active.is_none_or(|a| a == runner.active)
            && self.zone.as_deref().is_none_or(|z| z == runner.zone)
            && self.online_since.is_none_or(|(online, deadline)| {
                (runner.contacted_at > deadline) == online
            })
    }
}

/// Persistence of jobs, the pending index and per-project usage
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a `Pending` job together with its pending-index row.
    async fn create_job(&self, job: NewJob) -> StoreResult<Job>;

    async fn find_job(&self, id: i64) -> StoreResult<Option<Job>>;

    /// Pending jobs matching the filter, ascending by id.
    async fn find_pending(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;

    /// Conditionally move a job from `Pending` to `Running`.
    ///
    /// Returns `None` when the job was no longer pending, which means another
    /// dispatcher assigned it first. Removes the pending-index row on success.
    async fn assign_runner(
        &self,
        job_id: i64,
        runner_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<Job>>;

    /// Conditionally seal a `Running` job.
    ///
    /// Returns the updated job, or `None` if the job was not running.
    async fn complete_job(&self, job_id: i64, completion: JobCompletion)
    -> StoreResult<Option<Job>>;

    /// Mark a `Pending` or `Running` job as canceled.
    async fn cancel_job(&self, job_id: i64, ended_at: DateTime<Utc>) -> StoreResult<Option<Job>>;

    /// Running jobs started before the given instant.
    async fn find_running_started_before(&self, before: DateTime<Utc>) -> StoreResult<Vec<Job>>;

    async fn find_running_by_runner(&self, runner_id: Uuid) -> StoreResult<Vec<Job>>;

    /// Number of pending jobs per job type; absent types have no pending job.
    async fn count_pending_by_type(&self) -> StoreResult<Vec<(JobType, i64)>>;

    async fn record_usage(&self, project_id: i64, job_count: i64, duration_ms: i64)
    -> StoreResult<()>;

    async fn project_usage(&self, project_id: i64) -> StoreResult<ProjectUsage>;
}

/// Persistence of runners and the known-zone list
#[async_trait]
pub trait RunnerRepository: Send + Sync {
    async fn create_runner(&self, runner: &Runner) -> StoreResult<()>;

    async fn find_runner(&self, id: Uuid) -> StoreResult<Option<Runner>>;

    async fn find_runner_by_token(&self, token: &str) -> StoreResult<Option<Runner>>;

    /// Overwrite the mutable fields of an existing runner.
    async fn save_runner(&self, runner: &Runner) -> StoreResult<()>;

    async fn list_runners(&self, filter: &RunnerFilter) -> StoreResult<Vec<Runner>>;

    async fn delete_runner(&self, id: Uuid) -> StoreResult<bool>;

    async fn known_zones(&self) -> StoreResult<Vec<String>>;

    /// Returns `true` if the zone was not known before.
    async fn add_known_zone(&self, zone: &str) -> StoreResult<bool>;
}

/// Everything the dispatch core needs from persistence
pub trait JobStore: JobRepository + RunnerRepository {}

impl<T: JobRepository + RunnerRepository> JobStore for T {}
