//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Zone value meaning "no routing preference".
///
/// Jobs carrying this zone can be taken by any runner, and runners in this
/// zone see pending jobs from every zone.
pub const UNKNOWN_ZONE: &str = "unknown";

/// Work item handed out to runners
///
/// Structure shared between orchestrator (persists) and runner (executes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Global numeric identifier, monotonically increasing
    pub id: i64,
    /// Per-project sequential display id
    pub iid: i64,
    pub project_id: i64,
    pub job_type: JobType,
    /// Opaque reference to the analyzed entity (artifact, report, ...)
    pub entity_id: i64,
    pub zone: String,
    pub status: JobStatus,
    pub runner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Execution time in milliseconds as reported by the runner
    pub duration: Option<i64>,
    /// Resolver-owned metadata, never interpreted by the dispatcher
    pub extra: Option<serde_json::Value>,
}

impl Job {
    pub fn canceled(&self) -> bool {
        self.status == JobStatus::Canceled
    }

    /// Milliseconds between creation and assignment, if assigned.
    pub fn pending_time_ms(&self) -> Option<i64> {
        self.started_at
            .map(|started| (started - self.created_at).num_milliseconds())
    }
}

/// Job lifecycle status
///
/// `Pending -> Running -> {Done | Canceled | Failed}`. The last three are
/// sealed: no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Canceled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Done => "Done",
            JobStatus::Canceled => "Canceled",
            JobStatus::Failed => "Failed",
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Canceled | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(JobStatus::Pending),
            "Running" => Ok(JobStatus::Running),
            "Done" => Ok(JobStatus::Done),
            "Canceled" => Ok(JobStatus::Canceled),
            "Failed" => Ok(JobStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Capability tag of a job, and of the runners able to take it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobType {
    /// Runner-side only: accepts every job type
    All,
    BundleAnalyze,
    LabAnalyze,
    E2EAnalyze,
    LabPing,
    SourceAnalyze,
    PackageAnalyze,
}

impl JobType {
    /// Every job type, `All` included.
    pub const VARIANTS: [JobType; 7] = [
        JobType::All,
        JobType::BundleAnalyze,
        JobType::LabAnalyze,
        JobType::E2EAnalyze,
        JobType::LabPing,
        JobType::SourceAnalyze,
        JobType::PackageAnalyze,
    ];

    /// Group leaders, one per capability bucket.
    pub const GROUPS: [JobType; 4] = [
        JobType::BundleAnalyze,
        JobType::LabAnalyze,
        JobType::SourceAnalyze,
        JobType::PackageAnalyze,
    ];

    /// Concrete job types (everything but `All`).
    pub fn concrete() -> impl Iterator<Item = JobType> {
        Self::VARIANTS.into_iter().filter(|t| *t != JobType::All)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::All => "All",
            JobType::BundleAnalyze => "BundleAnalyze",
            JobType::LabAnalyze => "LabAnalyze",
            JobType::E2EAnalyze => "E2EAnalyze",
            JobType::LabPing => "LabPing",
            JobType::SourceAnalyze => "SourceAnalyze",
            JobType::PackageAnalyze => "PackageAnalyze",
        }
    }

    /// The leader of the capability bucket this type belongs to.
    ///
    /// `All` is its own leader.
    pub fn group_leader(&self) -> JobType {
        match self {
            JobType::LabAnalyze | JobType::E2EAnalyze | JobType::LabPing => JobType::LabAnalyze,
            other => *other,
        }
    }

    /// Every job type sharing this type's capability bucket.
    pub fn group(&self) -> &'static [JobType] {
        match self.group_leader() {
            JobType::All => &[],
            JobType::BundleAnalyze => &[JobType::BundleAnalyze],
            JobType::LabAnalyze => &[JobType::LabAnalyze, JobType::E2EAnalyze, JobType::LabPing],
            JobType::SourceAnalyze => &[JobType::SourceAnalyze],
            JobType::PackageAnalyze => &[JobType::PackageAnalyze],
            // group_leader never maps to a non-leader
            JobType::E2EAnalyze | JobType::LabPing => &[],
        }
    }

    /// Recommended number of jobs a runner of this capability should run at once.
    pub fn recommended_concurrency(&self) -> u32 {
        match self.group_leader() {
            JobType::BundleAnalyze | JobType::SourceAnalyze => 3,
            _ => 1,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::VARIANTS
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Returned when parsing an unrecognized status or job type name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl std::fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}
