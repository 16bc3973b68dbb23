//! Reaper
//!
//! Periodic sweep sealing jobs stuck in `Running` past the deadline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conveyor_core::domain::job::{Job, JobStatus};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, JobEvent};
use crate::lock::DispatchLock;
use crate::metrics::Metrics;
use crate::repository::{JobCompletion, JobStore};

/// Duration charged when a running job has no start time
const FALLBACK_DURATION_MS: i64 = 60 * 60 * 1000;

pub struct ReaperSweep {
    store: Arc<dyn JobStore>,
    events: EventBus,
    metrics: Arc<Metrics>,
    running_deadline: Duration,
    interval: Duration,
    lock: Option<Arc<dyn DispatchLock>>,
}

impl ReaperSweep {
    pub fn new(
        store: Arc<dyn JobStore>,
        events: EventBus,
        metrics: Arc<Metrics>,
        running_deadline: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            events,
            metrics,
            running_deadline,
            interval,
            lock: None,
        }
    }

    /// Also purge lapsed dispatch leases on every sweep
    pub fn with_lock(mut self, lock: Arc<dyn DispatchLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Seal every job that started before `now - running_deadline`
    ///
    /// Reaped jobs become `Done` with the elapsed time as duration and count
    /// as failures. Jobs finished concurrently by their runner are skipped.
    pub async fn sweep(&self) -> Vec<Job> {
        let now = Utc::now();
        let deadline = chrono::Duration::from_std(self.running_deadline)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        let stale = match self.store.find_running_started_before(now - deadline).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("Failed to query running jobs: {}", e);
                return Vec::new();
            }
        };

        let mut reaped = Vec::new();
        let mut usage: BTreeMap<i64, i64> = BTreeMap::new();

        for job in stale {
            let duration_ms = job
                .started_at
                .map(|started| (now - started).num_milliseconds())
                .unwrap_or(FALLBACK_DURATION_MS);

            let completion = JobCompletion {
                status: JobStatus::Done,
                duration_ms,
                ended_at: now,
            };

            let done = match self.store.complete_job(job.id, completion).await {
                Ok(Some(done)) => done,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!("Failed to reap job {}: {}", job.id, e);
                    continue;
                }
            };

            tracing::warn!("Job {} timed out after {}ms", done.id, duration_ms);

            *usage.entry(done.project_id).or_default() += duration_ms;
            self.metrics.job_failed(done.job_type);
            self.events.publish(JobEvent::Error {
                job_id: done.id,
                job_type: done.job_type,
                project_id: done.project_id,
                entity_id: done.entity_id,
                reason: "Timeout".to_string(),
            });

            reaped.push(done);
        }

        for (project_id, duration_ms) in usage {
            if let Err(e) = self.store.record_usage(project_id, 0, duration_ms).await {
                tracing::error!("Failed to record usage of project {}: {}", project_id, e);
            }
        }

        if !reaped.is_empty() {
            tracing::info!("Reaped {} timed out job(s)", reaped.len());
        }

        if let Some(lock) = &self.lock {
            match lock.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!("Purged {} lapsed dispatch lease(s)", purged),
                Err(e) => tracing::error!("Failed to purge dispatch leases: {}", e),
            }
        }

        reaped
    }

    /// Sweep every `interval` until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);

        tracing::info!("Reaper started (every {:?})", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }

        tracing::info!("Reaper stopped");
    }
}
