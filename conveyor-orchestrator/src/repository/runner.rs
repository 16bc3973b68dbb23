//! Runner Repository
//!
//! Handles all database operations related to runners and known zones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::runner::Runner;
use std::collections::HashMap;
use uuid::Uuid;

use super::job::{PgStore, parse_job_type};
use super::{RunnerFilter, RunnerRepository, StoreError, StoreResult};

const RUNNER_COLUMNS: &str = r#"
    id, name, token, job_type, zone, active, contacted_at, created_at,
    version, platform, arch, extra
"#;

#[async_trait]
impl RunnerRepository for PgStore {
    async fn create_runner(&self, runner: &Runner) -> StoreResult<()> {
        let extra = runner.extra.as_ref().map(serde_json::to_value).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO runners (id, name, token, job_type, zone, active, contacted_at,
                                 created_at, version, platform, arch, extra)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(runner.id)
        .bind(&runner.name)
        .bind(&runner.token)
        .bind(runner.job_type.as_str())
        .bind(&runner.zone)
        .bind(runner.active)
        .bind(runner.contacted_at)
        .bind(runner.created_at)
        .bind(&runner.version)
        .bind(&runner.platform)
        .bind(&runner.arch)
        .bind(extra)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_runner(&self, id: Uuid) -> StoreResult<Option<Runner>> {
        let row = sqlx::query_as::<_, RunnerRow>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Runner::try_from).transpose()
    }

    async fn find_runner_by_token(&self, token: &str) -> StoreResult<Option<Runner>> {
        let row = sqlx::query_as::<_, RunnerRow>(&format!(
            "SELECT {RUNNER_COLUMNS} FROM runners WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Runner::try_from).transpose()
    }

    async fn save_runner(&self, runner: &Runner) -> StoreResult<()> {
        let extra = runner.extra.as_ref().map(serde_json::to_value).transpose()?;

        sqlx::query(
            r#"
            UPDATE runners
            SET name = $1, job_type = $2, zone = $3, active = $4, contacted_at = $5,
                version = $6, platform = $7, arch = $8, extra = $9
            WHERE id = $10
            "#,
        )
        .bind(&runner.name)
        .bind(runner.job_type.as_str())
        .bind(&runner.zone)
        .bind(runner.active)
        .bind(runner.contacted_at)
        .bind(&runner.version)
        .bind(&runner.platform)
        .bind(&runner.arch)
        .bind(extra)
        .bind(runner.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_runners(&self, filter: &RunnerFilter) -> StoreResult<Vec<Runner>> {
        let (online, deadline) = match filter.online_since {
            Some((online, deadline)) => (Some(online), Some(deadline)),
            None => (None, None),
        };

        let rows = sqlx::query_as::<_, RunnerRow>(&format!(
            r#"
            SELECT {RUNNER_COLUMNS}
            FROM runners
            WHERE ($1::TEXT IS NULL OR job_type = $1)
              AND ($2::BOOLEAN IS NULL OR active = $2)
              AND ($3::TEXT IS NULL OR zone = $3)
              AND ($4::BOOLEAN IS NULL OR (contacted_at > $5) = $4)
            ORDER BY created_at DESC
            "#
        ))
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(filter.active)
        .bind(&filter.zone)
        .bind(online)
        .bind(deadline)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Runner::try_from).collect()
    }

    async fn delete_runner(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM runners WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn known_zones(&self) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT zone FROM job_zones ORDER BY added_at ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(zone,)| zone).collect())
    }

    async fn add_known_zone(&self, zone: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_zones (zone, added_at)
            VALUES ($1, $2)
            ON CONFLICT (zone) DO NOTHING
            "#,
        )
        .bind(zone)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunnerRow {
    id: Uuid,
    name: String,
    token: String,
    job_type: String,
    zone: String,
    active: bool,
    contacted_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    version: Option<String>,
    platform: Option<String>,
    arch: Option<String>,
    extra: Option<serde_json::Value>,
}

impl TryFrom<RunnerRow> for Runner {
    type Error = StoreError;

    fn try_from(row: RunnerRow) -> Result<Self, Self::Error> {
        let extra: Option<HashMap<String, String>> =
            row.extra.map(serde_json::from_value).transpose()?;

        Ok(Runner {
            id: row.id,
            name: row.name,
            token: row.token,
            job_type: parse_job_type(&row.job_type)?,
            zone: row.zone,
            active: row.active,
            contacted_at: row.contacted_at,
            created_at: row.created_at,
            version: row.version,
            platform: row.platform,
            arch: row.arch,
            extra,
        })
    }
}
