use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create jobs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            iid BIGINT NOT NULL,
            project_id BIGINT NOT NULL,
            job_type VARCHAR(50) NOT NULL,
            entity_id BIGINT NOT NULL,
            zone VARCHAR(255) NOT NULL,
            status VARCHAR(50) NOT NULL,
            runner_id UUID,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            ended_at TIMESTAMPTZ,
            duration BIGINT,
            extra JSONB,
            UNIQUE (project_id, iid)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Pending index, one row per Pending job
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_jobs (
            job_id BIGINT PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
            job_type VARCHAR(50) NOT NULL,
            zone VARCHAR(255) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-project display id counters
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS internal_ids (
            project_id BIGINT PRIMARY KEY,
            last_value BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_usage (
            project_id BIGINT PRIMARY KEY,
            job_count BIGINT NOT NULL DEFAULT 0,
            job_duration_ms BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_runner_id ON jobs(runner_id, status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pending_jobs_zone_type ON pending_jobs(zone, job_type, job_id)",
    )
    .execute(pool)
    .await?;

    // Create runners table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runners (
            id UUID PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            token VARCHAR(128) NOT NULL UNIQUE,
            job_type VARCHAR(50) NOT NULL,
            zone VARCHAR(255) NOT NULL,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            contacted_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            version VARCHAR(255),
            platform VARCHAR(255),
            arch VARCHAR(255),
            extra JSONB
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_runners_contacted_at ON runners(contacted_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_zones (
            zone VARCHAR(255) PRIMARY KEY,
            added_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Short-lived claim leases shared by every orchestrator instance
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dispatch_locks (
            key VARCHAR(255) PRIMARY KEY,
            holder UUID NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
