//! In-memory store
//!
//! Backs tests and database-less runs. Each operation takes the single state
//! lock, so conditional updates are atomic exactly like their SQL guards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::job::{Job, JobStatus, JobType};
use conveyor_core::domain::runner::Runner;
use conveyor_core::dto::job::ProjectUsage;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    JobCompletion, JobFilter, JobRepository, NewJob, RunnerFilter, RunnerRepository, StoreResult,
};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<i64, Job>,
    /// Pending index: job id -> (job type, zone)
    pending: BTreeMap<i64, (JobType, String)>,
    runners: HashMap<Uuid, Runner>,
    last_job_id: i64,
    iids: HashMap<i64, i64>,
    zones: Vec<String>,
    usage: HashMap<i64, ProjectUsage>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite a job as-is. Used to seed fixtures with arbitrary timestamps.
    pub fn put_job(&self, job: Job) {
        let mut state = self.state();
        if job.status == JobStatus::Pending {
            state.pending.insert(job.id, (job.job_type, job.zone.clone()));
        } else {
            state.pending.remove(&job.id);
        }
        state.last_job_id = state.last_job_id.max(job.id);
        state.jobs.insert(job.id, job);
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create_job(&self, job: NewJob) -> StoreResult<Job> {
        let mut state = self.state();

        state.last_job_id += 1;
        let id = state.last_job_id;
        let iid = {
            let counter = state.iids.entry(job.project_id).or_insert(0);
            *counter += 1;
            *counter
        };

        let job = Job {
            id,
            iid,
            project_id: job.project_id,
            job_type: job.job_type,
            entity_id: job.entity_id,
            zone: job.zone,
            status: JobStatus::Pending,
            runner_id: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration: None,
            extra: job.extra,
        };

        state.pending.insert(id, (job.job_type, job.zone.clone()));
        state.jobs.insert(id, job.clone());

        Ok(job)
    }

    async fn find_job(&self, id: i64) -> StoreResult<Option<Job>> {
        Ok(self.state().jobs.get(&id).cloned())
    }

    async fn find_pending(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let state = self.state();

        Ok(state
            .pending
            .iter()
            .filter(|(id, (job_type, zone))| filter.matches(**id, *job_type, zone))
            .filter_map(|(id, _)| state.jobs.get(id))
            .filter(|job| job.status == JobStatus::Pending)
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn assign_runner(
        &self,
        job_id: i64,
        runner_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        let mut state = self.state();

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }

        job.status = JobStatus::Running;
        job.runner_id = Some(runner_id);
        job.started_at = Some(started_at);
        let job = job.clone();

        state.pending.remove(&job_id);
        Ok(Some(job))
    }

    async fn complete_job(
        &self,
        job_id: i64,
        completion: JobCompletion,
    ) -> StoreResult<Option<Job>> {
        let mut state = self.state();

        Ok(state
            .jobs
            .get_mut(&job_id)
            .filter(|job| job.status == JobStatus::Running)
            .map(|job| {
                job.status = completion.status;
                job.duration = Some(completion.duration_ms);
                job.ended_at = Some(completion.ended_at);
                job.clone()
            }))
    }

    async fn cancel_job(&self, job_id: i64, ended_at: DateTime<Utc>) -> StoreResult<Option<Job>> {
        let mut state = self.state();
        state.pending.remove(&job_id);

        Ok(state
            .jobs
            .get_mut(&job_id)
            .filter(|job| !job.status.is_sealed())
            .map(|job| {
                job.status = JobStatus::Canceled;
                job.ended_at = Some(ended_at);
                job.clone()
            }))
    }

    async fn find_running_started_before(&self, before: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        Ok(self
            .state()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .filter(|job| job.started_at.is_some_and(|started| started < before))
            .cloned()
            .collect())
    }

    async fn find_running_by_runner(&self, runner_id: Uuid) -> StoreResult<Vec<Job>> {
        Ok(self
            .state()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running && job.runner_id == Some(runner_id))
            .cloned()
            .collect())
    }

    async fn count_pending_by_type(&self) -> StoreResult<Vec<(JobType, i64)>> {
        let state = self.state();
        let mut counts: BTreeMap<JobType, i64> = BTreeMap::new();
        for job in state.jobs.values().filter(|j| j.status == JobStatus::Pending) {
            *counts.entry(job.job_type).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn record_usage(
        &self,
        project_id: i64,
        job_count: i64,
        duration_ms: i64,
    ) -> StoreResult<()> {
        let mut state = self.state();
        let usage = state.usage.entry(project_id).or_insert(ProjectUsage {
            project_id,
            ..Default::default()
        });
        usage.job_count += job_count;
        usage.job_duration_ms += duration_ms;
        Ok(())
    }

    async fn project_usage(&self, project_id: i64) -> StoreResult<ProjectUsage> {
        Ok(self
            .state()
            .usage
            .get(&project_id)
            .copied()
            .unwrap_or(ProjectUsage {
                project_id,
                ..Default::default()
            }))
    }
}

#[async_trait]
impl RunnerRepository for MemoryStore {
    async fn create_runner(&self, runner: &Runner) -> StoreResult<()> {
        self.state().runners.insert(runner.id, runner.clone());
        Ok(())
    }

    async fn find_runner(&self, id: Uuid) -> StoreResult<Option<Runner>> {
        Ok(self.state().runners.get(&id).cloned())
    }

    async fn find_runner_by_token(&self, token: &str) -> StoreResult<Option<Runner>> {
        Ok(self
            .state()
            .runners
            .values()
            .find(|runner| runner.token == token)
            .cloned())
    }

    async fn save_runner(&self, runner: &Runner) -> StoreResult<()> {
        let mut state = self.state();
        if let Some(existing) = state.runners.get_mut(&runner.id) {
            *existing = runner.clone();
        }
        Ok(())
    }

    async fn list_runners(&self, filter: &RunnerFilter) -> StoreResult<Vec<Runner>> {
        let mut runners: Vec<Runner> = self
            .state()
            .runners
            .values()
            .filter(|runner| filter.matches(runner))
            .cloned()
            .collect();
        runners.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runners)
    }

    async fn delete_runner(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.state().runners.remove(&id).is_some())
    }

    async fn known_zones(&self) -> StoreResult<Vec<String>> {
        Ok(self.state().zones.clone())
    }

    async fn add_known_zone(&self, zone: &str) -> StoreResult<bool> {
        let mut state = self.state();
        if state.zones.iter().any(|z| z == zone) {
            return Ok(false);
        }
        state.zones.push(zone.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_job(job_type: JobType, zone: &str) -> NewJob {
        NewJob {
            job_type,
            project_id: 1,
            entity_id: 10,
            zone: zone.to_string(),
            extra: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_iids() {
        let store = MemoryStore::new();

        let a = store.create_job(new_job(JobType::LabAnalyze, "eu")).await.unwrap();
        let b = store.create_job(new_job(JobType::LabAnalyze, "eu")).await.unwrap();
        let other = store
            .create_job(NewJob {
                project_id: 2,
                ..new_job(JobType::LabAnalyze, "eu")
            })
            .await
            .unwrap();

        assert_eq!((a.id, a.iid), (1, 1));
        assert_eq!((b.id, b.iid), (2, 2));
        assert_eq!((other.id, other.iid), (3, 1));
        assert_eq!(a.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_assign_is_conditional() {
        let store = MemoryStore::new();
        let job = store.create_job(new_job(JobType::LabPing, "eu")).await.unwrap();

        let first = store
            .assign_runner(job.id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        let second = store
            .assign_runner(job.id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();

        assert_eq!(first.map(|j| j.status), Some(JobStatus::Running));
        assert!(second.is_none());

        let filter = JobFilter {
            zone: None,
            job_types: None,
            after_id: None,
            limit: 20,
        };
        assert!(store.find_pending(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_ignores_sealed_jobs() {
        let store = MemoryStore::new();
        let job = store.create_job(new_job(JobType::LabPing, "eu")).await.unwrap();
        store
            .assign_runner(job.id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();

        let completion = JobCompletion {
            status: JobStatus::Done,
            duration_ms: 500,
            ended_at: Utc::now(),
        };
        let done = store.complete_job(job.id, completion).await.unwrap();
        assert_eq!(done.map(|j| j.duration), Some(Some(500)));

        let again = store
            .complete_job(
                job.id,
                JobCompletion {
                    status: JobStatus::Failed,
                    ..completion
                },
            )
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(
            store.find_job(job.id).await.unwrap().map(|j| j.status),
            Some(JobStatus::Done)
        );
    }

    #[tokio::test]
    async fn test_running_started_before() {
        let store = MemoryStore::new();
        let old = store.create_job(new_job(JobType::LabPing, "eu")).await.unwrap();
        let fresh = store.create_job(new_job(JobType::LabPing, "eu")).await.unwrap();
        let now = Utc::now();

        store
            .assign_runner(old.id, Uuid::new_v4(), now - Duration::hours(2))
            .await
            .unwrap();
        store
            .assign_runner(fresh.id, Uuid::new_v4(), now - Duration::minutes(10))
            .await
            .unwrap();

        let stale = store
            .find_running_started_before(now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stale.iter().map(|j| j.id).collect::<Vec<_>>(), vec![old.id]);
    }

    #[tokio::test]
    async fn test_known_zones_deduplicate() {
        let store = MemoryStore::new();
        assert!(store.add_known_zone("eu").await.unwrap());
        assert!(!store.add_known_zone("eu").await.unwrap());
        assert!(store.add_known_zone("us").await.unwrap());
        assert_eq!(store.known_zones().await.unwrap(), vec!["eu", "us"]);
    }

    #[tokio::test]
    async fn test_usage_accumulates() {
        let store = MemoryStore::new();
        store.record_usage(7, 1, 100).await.unwrap();
        store.record_usage(7, 2, 50).await.unwrap();

        let usage = store.project_usage(7).await.unwrap();
        assert_eq!((usage.job_count, usage.job_duration_ms), (3, 150));
        assert_eq!(store.project_usage(8).await.unwrap().job_count, 0);
    }
}
