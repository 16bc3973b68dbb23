//! Dispatch Lock
//!
//! Short-lived, keyed leases that keep two dispatchers from claiming the same
//! job at once. The Postgres lock is shared by every orchestrator instance;
//! the in-memory one only serializes within a process.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Non-blocking, expiring mutual exclusion keyed by string
#[async_trait]
pub trait DispatchLock: Send + Sync {
    /// Take the lease on `key` for `ttl`.
    ///
    /// Returns `false` immediately if someone else holds an unexpired lease.
    /// Leases are never released explicitly; they lapse after `ttl`.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Drop leases that have already lapsed. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, LockError> {
        Ok(0)
    }
}

/// Process-local lock
#[derive(Debug, Default)]
pub struct MemoryDispatchLock {
    leases: Mutex<HashMap<String, Instant>>,
}

impl MemoryDispatchLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DispatchLock for MemoryDispatchLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases();

        if leases.get(key).is_some_and(|expires| *expires > now) {
            return Ok(false);
        }

        leases.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn purge_expired(&self) -> Result<u64, LockError> {
        let now = Instant::now();
        let mut leases = self.leases();
        let before = leases.len();
        leases.retain(|_, expires| *expires > now);
        Ok((before - leases.len()) as u64)
    }
}

/// Lock backed by the `dispatch_locks` table
#[derive(Debug, Clone)]
pub struct PgDispatchLock {
    pool: PgPool,
    holder: Uuid,
}

impl PgDispatchLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            holder: Uuid::new_v4(),
        }
    }
}

#[async_trait]
impl DispatchLock for PgDispatchLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(ttl.as_millis() as i64);

        // Insert a fresh lease, or take over one that has lapsed. A live lease
        // held by anyone matches neither branch and affects no row.
        let result = sqlx::query(
            r#"
            INSERT INTO dispatch_locks (key, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE dispatch_locks.expires_at < $4
            "#,
        )
        .bind(key)
        .bind(self.holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> Result<u64, LockError> {
        let result = sqlx::query("DELETE FROM dispatch_locks WHERE expires_at < $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
