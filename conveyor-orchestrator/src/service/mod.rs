//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between repositories, the dispatch lock and blob
//! storage, and contain the domain logic.

pub mod dispatch;
pub mod job;
pub mod payload;
pub mod reaper;
pub mod runner;
pub mod trace;

use thiserror::Error;

use crate::lock::LockError;
use crate::repository::StoreError;
use crate::storage::StorageError;

// Re-export for convenience
pub use dispatch::Dispatcher;
pub use job::JobService;
pub use payload::{PayloadResolver, PayloadResolverRegistry};
pub use reaper::ReaperSweep;
pub use runner::{AccessTokenResolver, RunnerService, StaticAccessTokens};
pub use trace::TraceSink;

/// Service error type
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("job trace has expired")]
    TraceExpired,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
