//! Job Service
//!
//! Business logic for job creation, completion and queries.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use conveyor_core::domain::job::{Job, JobStatus, JobType};
use conveyor_core::domain::trace::TraceEntry;
use conveyor_core::dto::job::{CreateJob, PendingJobCount, ProjectUsage};

use super::trace::TraceSink;
use super::{DispatchError, Result};
use crate::metrics::Metrics;
use crate::repository::{JobCompletion, JobStore, NewJob};

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    traces: TraceSink,
    metrics: Arc<Metrics>,
    default_zone: String,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        traces: TraceSink,
        metrics: Arc<Metrics>,
        default_zone: String,
    ) -> Self {
        Self {
            store,
            traces,
            metrics,
            default_zone,
        }
    }

    /// Create a single pending job
    pub async fn create_job(&self, req: CreateJob) -> Result<Job> {
        if req.job_type == JobType::All {
            return Err(DispatchError::BadRequest(
                "jobs need a concrete job type".to_string(),
            ));
        }

        let job = self
            .store
            .create_job(NewJob {
                job_type: req.job_type,
                project_id: req.project_id,
                entity_id: req.entity_id,
                zone: req.zone.unwrap_or_else(|| self.default_zone.clone()),
                extra: req.extra,
            })
            .await?;

        tracing::info!(
            "Job created: {} ({}, project {}, zone {})",
            job.id,
            job.job_type,
            job.project_id,
            job.zone
        );

        Ok(job)
    }

    /// Create a batch of jobs
    ///
    /// Individual failures are logged and skipped. Job-count usage and the
    /// created metric cover the jobs actually created.
    pub async fn create_jobs(&self, reqs: Vec<CreateJob>) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(reqs.len());
        for req in reqs {
            match self.create_job(req).await {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::error!("Failed to create job: {}", e),
            }
        }

        let mut per_project: BTreeMap<i64, i64> = BTreeMap::new();
        for job in &jobs {
            *per_project.entry(job.project_id).or_default() += 1;
            self.metrics.job_created(job.job_type);
        }
        for (project_id, count) in per_project {
            if let Err(e) = self.store.record_usage(project_id, count, 0).await {
                tracing::error!("Failed to record job usage of project {}: {}", project_id, e);
            }
        }

        jobs
    }

    /// Get a job by ID
    pub async fn get_job(&self, id: i64) -> Result<Job> {
        self.store
            .find_job(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Job {id}")))
    }

    /// Seal a running job
    ///
    /// `errored` counts the job as a failure even when sealed as `Done`.
    /// `logs` are appended to the job trace after the status update. A job
    /// that is no longer running is left untouched and `None` is returned, so
    /// duplicate completion reports are harmless.
    pub async fn job_done(
        &self,
        job: &Job,
        status: JobStatus,
        duration_ms: i64,
        errored: bool,
        logs: Vec<TraceEntry>,
    ) -> Result<Option<Job>> {
        let completion = JobCompletion {
            status,
            duration_ms,
            ended_at: Utc::now(),
        };

        let Some(done) = self.store.complete_job(job.id, completion).await? else {
            tracing::debug!("Job {} already sealed, ignoring completion", job.id);
            return Ok(None);
        };

        self.store
            .record_usage(done.project_id, 0, duration_ms)
            .await?;

        if let Err(e) = self.traces.append_trace(&done, logs).await {
            tracing::error!("Failed to write trace of job {}: {}", done.id, e);
        }

        if errored {
            self.metrics.job_failed(done.job_type);
        } else {
            self.metrics.job_succeeded(done.job_type);
        }

        tracing::info!("Job {} finished: {} in {}ms", done.id, done.status, duration_ms);

        Ok(Some(done))
    }

    /// Cancel a job that has not finished yet
    pub async fn cancel_job(&self, id: i64) -> Result<Job> {
        let job = self.get_job(id).await?;

        match self.store.cancel_job(id, Utc::now()).await? {
            Some(canceled) => {
                tracing::info!("Job canceled: {}", id);
                Ok(canceled)
            }
            None => {
                tracing::debug!("Job {} already sealed as {}", id, job.status);
                Ok(job)
            }
        }
    }

    /// Pending job count of every concrete job type
    pub async fn pending_counts(&self) -> Result<Vec<PendingJobCount>> {
        let counts = self.store.count_pending_by_type().await?;

        Ok(JobType::concrete()
            .map(|job_type| PendingJobCount {
                job_type,
                count: counts
                    .iter()
                    .find(|(t, _)| *t == job_type)
                    .map_or(0, |(_, count)| *count),
            })
            .collect())
    }

    pub async fn project_usage(&self, project_id: i64) -> Result<ProjectUsage> {
        Ok(self.store.project_usage(project_id).await?)
    }

    pub fn traces(&self) -> &TraceSink {
        &self.traces
    }
}
