//! Trace DTOs for inter-service communication

use serde::{Deserialize, Serialize};

use crate::domain::trace::TraceEntry;

/// Trace chunk (and optional completion report) sent by a runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJobTrace {
    pub job_id: i64,
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
    /// Set on the final report of a job
    #[serde(default)]
    pub done: bool,
    /// Execution time in milliseconds, authoritative when `done`
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub failed_reason: Option<String>,
    /// Job-type specific progress, forwarded to event subscribers
    #[serde(default)]
    pub job_updates: Option<serde_json::Value>,
}

/// Acknowledgement of a trace update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateJobTraceResponse {
    /// Tells the runner to stop working on the job
    pub canceled: bool,
}

/// Paging query for reading a job trace
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TraceQuery {
    #[serde(default)]
    pub after: Option<i64>,
}

/// A page of a job trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTracePage {
    pub entries: Vec<TraceEntry>,
    /// Index of the last stored entry; pass it back as `after`
    pub end_cursor: i64,
    /// True while the job has not ended
    pub has_more: bool,
}
