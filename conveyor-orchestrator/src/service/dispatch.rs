//! Dispatcher
//!
//! Runner-facing protocol: job requests, trace reports and artifacts.
//!
//! A job request is a single-shot poll. The eligible-jobs query runs inside
//! the admission queue; each candidate is then claimed under a short dispatch
//! lease and a conditional `Pending -> Running` update, so concurrent pollers
//! on any number of instances never hand out the same job twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use conveyor_core::domain::job::{Job, JobStatus, JobType, UNKNOWN_ZONE};
use conveyor_core::domain::runner::{Runner, RunnerInfo};
use conveyor_core::domain::trace::{TraceEntry, TraceLevel};
use conveyor_core::dto::job::{ArtifactUploaded, DispatchedJob, JobRequestResponse};
use conveyor_core::dto::runner::RunnerSettings;
use conveyor_core::dto::trace::{UpdateJobTrace, UpdateJobTraceResponse};
use tokio::time::Instant;

use super::job::JobService;
use super::payload::PayloadResolverRegistry;
use super::runner::{AccessTokenResolver, RunnerService};
use super::trace::TraceSink;
use super::{DispatchError, Result};
use crate::admission::AdmissionQueue;
use crate::config::Config;
use crate::events::{EventBus, JobEvent};
use crate::lock::DispatchLock;
use crate::metrics::Metrics;
use crate::repository::{JobFilter, JobStore};
use crate::storage::{BlobReader, BlobStore, StorageError, artifact_key};

const PAYLOAD_FAILURE: &str = "Failed to fetch job payload.";

/// How long a recorded bound is trusted
const WATERMARK_TTL: Duration = Duration::from_secs(10);

/// Per (job type group, zone) lower bound on pending job ids
///
/// The bound is the smallest pending id a full scan saw, minus one. Ids are
/// allocated before their transaction commits, so a job below the bound can
/// still turn up later. Bounds therefore expire after a short TTL, and a
/// bounded scan that yields no job is retried without the bound. The cache
/// only ever shortens scans.
#[derive(Debug)]
pub struct WatermarkCache {
    ttl: Duration,
    marks: Mutex<HashMap<(JobType, String), (i64, Instant)>>,
}

impl Default for WatermarkCache {
    fn default() -> Self {
        Self::new(WATERMARK_TTL)
    }
}

impl WatermarkCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            marks: Mutex::new(HashMap::new()),
        }
    }

    fn marks(&self) -> MutexGuard<'_, HashMap<(JobType, String), (i64, Instant)>> {
        self.marks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The live bound, if any
    pub fn get(&self, group: JobType, zone: &str) -> Option<i64> {
        let mut marks = self.marks();
        let key = (group, zone.to_string());
        match marks.get(&key) {
            Some((mark, recorded)) if recorded.elapsed() < self.ttl => Some(*mark),
            Some(_) => {
                marks.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Record `min_pending_id - 1` as the bound, replacing the previous one
    pub fn record(&self, group: JobType, zone: &str, min_pending_id: i64) {
        let key = (group, zone.to_string());
        let mark = min_pending_id - 1;
        let mut marks = self.marks();
        if mark <= 0 {
            marks.remove(&key);
        } else {
            marks.insert(key, (mark, Instant::now()));
        }
    }

    pub fn forget(&self, group: JobType, zone: &str) {
        self.marks().remove(&(group, zone.to_string()));
    }

    pub fn invalidate(&self) {
        self.marks().clear();
    }
}

/// Collaborators injected into the dispatcher
pub struct DispatcherDeps {
    pub store: Arc<dyn JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub lock: Arc<dyn DispatchLock>,
    pub resolvers: Arc<PayloadResolverRegistry>,
    pub access_tokens: Arc<dyn AccessTokenResolver>,
    pub events: EventBus,
    pub metrics: Arc<Metrics>,
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    lock: Arc<dyn DispatchLock>,
    resolvers: Arc<PayloadResolverRegistry>,
    events: EventBus,
    metrics: Arc<Metrics>,
    runners: RunnerService,
    jobs: JobService,
    traces: TraceSink,
    queue: AdmissionQueue,
    watermarks: WatermarkCache,
    lock_ttl: Duration,
    batch_size: usize,
    execution_timeout: Duration,
    maintenance: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: &Config, deps: DispatcherDeps) -> Self {
        let traces = TraceSink::new(deps.blobs.clone());
        let runners = RunnerService::new(
            deps.store.clone(),
            config.registration_token.clone(),
            deps.access_tokens,
        );
        let jobs = JobService::new(
            deps.store.clone(),
            traces.clone(),
            deps.metrics.clone(),
            config.default_job_zone.clone(),
        );

        Self {
            store: deps.store,
            blobs: deps.blobs,
            lock: deps.lock,
            resolvers: deps.resolvers,
            events: deps.events,
            metrics: deps.metrics,
            runners,
            jobs,
            traces,
            queue: AdmissionQueue::new(
                config.polling_limit,
                config.polling_queue_limit,
                config.polling_timeout,
            ),
            watermarks: WatermarkCache::default(),
            lock_ttl: config.dispatch_lock_ttl,
            batch_size: config.dispatch_batch_size,
            execution_timeout: config.execution_timeout,
            maintenance: AtomicBool::new(config.maintenance_mode),
        }
    }

    pub fn runners(&self) -> &RunnerService {
        &self.runners
    }

    pub fn jobs(&self) -> &JobService {
        &self.jobs
    }

    pub fn traces(&self) -> &TraceSink {
        &self.traces
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    pub fn watermarks(&self) -> &WatermarkCache {
        &self.watermarks
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Relaxed)
    }

    pub fn set_maintenance(&self, enabled: bool) {
        self.maintenance.store(enabled, Ordering::Relaxed);
        tracing::info!("Maintenance mode {}", if enabled { "enabled" } else { "disabled" });
    }

    // =========================================================================
    // Job request
    // =========================================================================

    /// Hand at most one job to the runner behind `token`
    pub async fn request_job(
        &self,
        token: &str,
        info: Option<RunnerInfo>,
    ) -> Result<JobRequestResponse> {
        if self.in_maintenance() {
            return Ok(JobRequestResponse::default());
        }

        let runner = self.runners.authenticate(token, info).await?;
        if !runner.active {
            return Ok(JobRequestResponse::default());
        }

        let mut response = JobRequestResponse {
            job: None,
            set: Some(RunnerSettings::for_job_type(runner.job_type)),
        };

        let started = Instant::now();
        let job = match self.queue.enqueue(self.next_job(&runner)).await {
            Ok(job) => job?,
            Err(e) => {
                tracing::warn!("Job request of runner {} not admitted: {}", runner.id, e);
                self.metrics.backpressure();
                None
            }
        };
        self.metrics.dispatch_duration(started.elapsed(), job.is_some());

        response.job = job;
        Ok(response)
    }

    fn eligible_filter(&self, runner: &Runner) -> JobFilter {
        let group = runner.job_type.group_leader();
        let (zone, after_id) = if runner.zone == UNKNOWN_ZONE {
            (None, None)
        } else {
            (
                Some(runner.zone.clone()),
                self.watermarks.get(group, &runner.zone),
            )
        };
        let job_types = match runner.job_type {
            JobType::All => None,
            job_type => Some(job_type.group().to_vec()),
        };

        JobFilter {
            zone,
            job_types,
            after_id,
            limit: self.batch_size,
        }
    }

    async fn next_job(&self, runner: &Runner) -> Result<Option<DispatchedJob>> {
        let filter = self.eligible_filter(runner);
        let bounded = filter.after_id.is_some();

        if let Some(job) = self.claim_first(runner, &filter).await? {
            return Ok(Some(job));
        }
        if !bounded {
            return Ok(None);
        }

        // Jobs committed below the bound are only visible to a full scan
        if let Some(zone) = &filter.zone {
            self.watermarks.forget(runner.job_type.group_leader(), zone);
        }
        let full = JobFilter {
            after_id: None,
            ..filter
        };
        self.claim_first(runner, &full).await
    }

    /// Claim the first candidate matching `filter` that can be dispatched
    async fn claim_first(
        &self,
        runner: &Runner,
        filter: &JobFilter,
    ) -> Result<Option<DispatchedJob>> {
        let candidates = self.store.find_pending(filter).await?;

        if filter.after_id.is_none() {
            if let (Some(zone), Some(first)) = (&filter.zone, candidates.first()) {
                self.watermarks
                    .record(runner.job_type.group_leader(), zone, first.id);
            }
        }

        tracing::debug!(
            "Runner {} sees {} candidate job(s)",
            runner.id,
            candidates.len()
        );

        for candidate in candidates {
            match self
                .lock
                .try_acquire(&format!("dispatch:job:{}", candidate.id), self.lock_ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("Job {} is being claimed elsewhere", candidate.id);
                    continue;
                }
                Err(e) => {
                    tracing::error!("Dispatch lock error for job {}: {}", candidate.id, e);
                    continue;
                }
            }

            let Some(job) = self
                .store
                .assign_runner(candidate.id, runner.id, Utc::now())
                .await?
            else {
                tracing::debug!("Job {} was assigned to another runner", candidate.id);
                continue;
            };

            if let Some(pending_ms) = job.pending_time_ms() {
                self.metrics.pending_time(job.job_type, pending_ms);
            }

            match self
                .resolvers
                .resolve(job.job_type, job.entity_id, job.extra.clone())
                .await
            {
                Ok(payload) => {
                    tracing::info!("Job {} dispatched to runner {}", job.id, runner.id);
                    return Ok(Some(DispatchedJob {
                        job_id: job.id,
                        job_type: job.job_type,
                        timeout: self.execution_timeout.as_secs(),
                        payload,
                    }));
                }
                Err(e) => self.payload_failed(&job, e).await,
            }
        }

        Ok(None)
    }

    async fn payload_failed(&self, job: &Job, err: anyhow::Error) {
        tracing::error!("Failed to fetch payload of job {}: {:#}", job.id, err);

        let entry = TraceEntry::new(
            TraceLevel::Error,
            Utc::now().timestamp_millis(),
            PAYLOAD_FAILURE,
        )
        .with_detail(format!("{err:#}"));

        if let Err(e) = self
            .jobs
            .job_done(job, JobStatus::Done, 0, true, vec![entry])
            .await
        {
            tracing::error!("Failed to seal job {}: {}", job.id, e);
        }

        self.events.publish(JobEvent::Error {
            job_id: job.id,
            job_type: job.job_type,
            project_id: job.project_id,
            entity_id: job.entity_id,
            reason: PAYLOAD_FAILURE.to_string(),
        });
    }

    // =========================================================================
    // Trace reports
    // =========================================================================

    /// Store a trace chunk and, on the final report, seal the job
    pub async fn update_trace(
        &self,
        token: &str,
        params: UpdateJobTrace,
    ) -> Result<UpdateJobTraceResponse> {
        let runner = self.runners.authenticate(token, None).await?;
        let job = self.jobs.get_job(params.job_id).await?;

        if job.runner_id.is_some_and(|id| id != runner.id) {
            return Err(DispatchError::Forbidden(format!(
                "job {} is not assigned to runner {}",
                job.id, runner.id
            )));
        }

        if job.canceled() {
            return Ok(UpdateJobTraceResponse { canceled: true });
        }

        if let Err(e) = self.traces.append_trace(&job, params.trace).await {
            tracing::error!("Failed to write trace of job {}: {}", job.id, e);
        }

        if params.done {
            let (status, errored) = match params.failed_reason {
                Some(_) => (JobStatus::Failed, true),
                None => (JobStatus::Done, false),
            };
            self.jobs
                .job_done(&job, status, params.duration.unwrap_or(0), errored, Vec::new())
                .await?;
        }

        if params.job_updates.is_some() || params.done {
            self.events.publish(JobEvent::Update {
                job_id: job.id,
                job_type: job.job_type,
                project_id: job.project_id,
                entity_id: job.entity_id,
                done: params.done,
                updates: params.job_updates,
            });
        }

        if let Some(reason) = params.failed_reason {
            self.events.publish(JobEvent::Error {
                job_id: job.id,
                job_type: job.job_type,
                project_id: job.project_id,
                entity_id: job.entity_id,
                reason,
            });
        }

        Ok(UpdateJobTraceResponse { canceled: false })
    }

    // =========================================================================
    // Artifacts
    // =========================================================================

    /// Store an artifact produced by the runner's current job
    pub async fn upload_artifact(
        &self,
        token: &str,
        job_id: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactUploaded> {
        let job_id: i64 = job_id
            .parse()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| DispatchError::Forbidden("invalid jobId".to_string()))?;

        let runner = self.runners.authenticate(token, None).await?;
        let job = self.jobs.get_job(job_id).await?;

        if job.runner_id != Some(runner.id) {
            return Err(DispatchError::Forbidden(format!(
                "job {} is not assigned to runner {}",
                job.id, runner.id
            )));
        }

        let final_key = artifact_key(job.project_id, key);
        let size = bytes.len();
        self.blobs.upload(&final_key, bytes).await.map_err(|e| match e {
            StorageError::InvalidKey(key) => DispatchError::BadRequest(format!("invalid key {key}")),
            other => other.into(),
        })?;

        tracing::info!("Artifact {} uploaded by job {} ({} bytes)", final_key, job.id, size);

        self.events.publish(JobEvent::Upload {
            job_id: job.id,
            job_type: job.job_type,
            project_id: job.project_id,
            entity_id: job.entity_id,
            key: final_key.clone(),
            size,
        });

        Ok(ArtifactUploaded {
            key: final_key,
            size,
        })
    }

    /// Stream a stored blob to an authenticated runner
    pub async fn download_artifact(&self, token: &str, key: &str) -> Result<BlobReader> {
        self.runners.authenticate(token, None).await?;

        self.blobs.get_stream(key).await.map_err(|e| match e {
            StorageError::NotFound(key) | StorageError::InvalidKey(key) => {
                DispatchError::NotFound(format!("Artifact {key}"))
            }
            other => other.into(),
        })
    }
}
