//! Job Repository
//!
//! Handles all database operations related to jobs, the pending index and
//! project usage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::job::{Job, JobStatus, JobType};
use conveyor_core::dto::job::ProjectUsage;
use sqlx::PgPool;
use uuid::Uuid;

use super::{JobCompletion, JobFilter, JobRepository, NewJob, StoreError, StoreResult};

const JOB_COLUMNS: &str = r#"
    jobs.id, jobs.iid, jobs.project_id, jobs.job_type, jobs.entity_id, jobs.zone,
    jobs.status, jobs.runner_id, jobs.created_at, jobs.started_at, jobs.ended_at,
    jobs.duration, jobs.extra
"#;

/// Postgres-backed store
#[derive(Debug, Clone)]
pub struct PgStore {
    pub(super) pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PgStore {
    async fn create_job(&self, job: NewJob) -> StoreResult<Job> {
        let mut tx = self.pool.begin().await?;

        let (iid,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO internal_ids (project_id, last_value)
            VALUES ($1, 1)
            ON CONFLICT (project_id) DO UPDATE SET last_value = internal_ids.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(job.project_id)
        .fetch_one(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (iid, project_id, job_type, entity_id, zone, status, created_at, extra)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(iid)
        .bind(job.project_id)
        .bind(job.job_type.as_str())
        .bind(job.entity_id)
        .bind(&job.zone)
        .bind(JobStatus::Pending.as_str())
        .bind(Utc::now())
        .bind(&job.extra)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO pending_jobs (job_id, job_type, zone, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(row.id)
        .bind(&row.job_type)
        .bind(&row.zone)
        .bind(row.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        row.try_into()
    }

    async fn find_job(&self, id: i64) -> StoreResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE jobs.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn find_pending(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let job_types: Option<Vec<String>> = filter
            .job_types
            .as_ref()
            .map(|types| types.iter().map(|t| t.as_str().to_string()).collect());

        // The pending index keeps this scan small as the jobs table grows.
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM pending_jobs
            JOIN jobs ON jobs.id = pending_jobs.job_id
            WHERE ($1::TEXT IS NULL OR pending_jobs.zone = $1)
              AND ($2::TEXT[] IS NULL OR pending_jobs.job_type = ANY($2))
              AND ($3::BIGINT IS NULL OR pending_jobs.job_id > $3)
              AND jobs.status = 'Pending'
            ORDER BY pending_jobs.job_id ASC
            LIMIT $4
            "#
        ))
        .bind(&filter.zone)
        .bind(job_types)
        .bind(filter.after_id)
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn assign_runner(
        &self,
        job_id: i64,
        runner_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        // The status guard makes the claim conditional: a job assigned by a
        // concurrent dispatcher no longer matches.
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'Running', runner_id = $1, started_at = $2
            WHERE id = $3 AND status = 'Pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(runner_id)
        .bind(started_at)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        if let Err(e) = sqlx::query("DELETE FROM pending_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
        {
            tracing::error!("Failed to delete pending index row for job {}: {}", job_id, e);
        }

        row.try_into().map(Some)
    }

    async fn complete_job(
        &self,
        job_id: i64,
        completion: JobCompletion,
    ) -> StoreResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = $1, duration = $2, ended_at = $3
            WHERE id = $4 AND status = 'Running'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(completion.status.as_str())
        .bind(completion.duration_ms)
        .bind(completion.ended_at)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn cancel_job(&self, job_id: i64, ended_at: DateTime<Utc>) -> StoreResult<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'Canceled', ended_at = $1
            WHERE id = $2 AND status IN ('Pending', 'Running')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(ended_at)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM pending_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        row.map(Job::try_from).transpose()
    }

    async fn find_running_started_before(&self, before: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'Running' AND started_at < $1
            ORDER BY id ASC
            "#
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn find_running_by_runner(&self, runner_id: Uuid) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'Running' AND runner_id = $1
            ORDER BY id ASC
            "#
        ))
        .bind(runner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn count_pending_by_type(&self) -> StoreResult<Vec<(JobType, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT job_type, COUNT(*) FROM jobs
            WHERE status = 'Pending'
            GROUP BY job_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(job_type, count)| Ok((parse_job_type(&job_type)?, count)))
            .collect()
    }

    async fn record_usage(
        &self,
        project_id: i64,
        job_count: i64,
        duration_ms: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO project_usage (project_id, job_count, job_duration_ms)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id) DO UPDATE SET
                job_count = project_usage.job_count + EXCLUDED.job_count,
                job_duration_ms = project_usage.job_duration_ms + EXCLUDED.job_duration_ms
            "#,
        )
        .bind(project_id)
        .bind(job_count)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn project_usage(&self, project_id: i64) -> StoreResult<ProjectUsage> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT job_count, job_duration_ms FROM project_usage WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        let (job_count, job_duration_ms) = row.unwrap_or_default();

        Ok(ProjectUsage {
            project_id,
            job_count,
            job_duration_ms,
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

pub(super) fn parse_job_type(s: &str) -> StoreResult<JobType> {
    s.parse()
        .map_err(|_| StoreError::InvalidRow(format!("unknown job type {s}")))
}

fn parse_status(s: &str) -> StoreResult<JobStatus> {
    s.parse()
        .map_err(|_| StoreError::InvalidRow(format!("unknown job status {s}")))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    iid: i64,
    project_id: i64,
    job_type: String,
    entity_id: i64,
    zone: String,
    status: String,
    runner_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration: Option<i64>,
    extra: Option<serde_json::Value>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            iid: row.iid,
            project_id: row.project_id,
            job_type: parse_job_type(&row.job_type)?,
            entity_id: row.entity_id,
            zone: row.zone,
            status: parse_status(&row.status)?,
            runner_id: row.runner_id,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration: row.duration,
            extra: row.extra,
        })
    }
}
