//! Runner Service
//!
//! Business logic for runner registration, authentication and administration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use conveyor_core::domain::job::{Job, JobType, UNKNOWN_ZONE};
use conveyor_core::domain::runner::{Runner, RunnerInfo};
use conveyor_core::dto::runner::{
    RegisterRunner, RegisterRunnerResponse, RunnerQuery, RunnerSettings, RunnerSummary,
    UpdateRunner,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{DispatchError, Result};
use crate::repository::{JobStore, RunnerFilter};

/// Runners contacted within this window count as online
const ONLINE_WINDOW_HOURS: i64 = 2;

/// Maps a per-user access token to its username
#[async_trait]
pub trait AccessTokenResolver: Send + Sync {
    async fn resolve_user(&self, token: &str) -> Option<String>;
}

/// Access tokens known up front, from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticAccessTokens {
    tokens: HashMap<String, String>,
}

impl StaticAccessTokens {
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AccessTokenResolver for StaticAccessTokens {
    async fn resolve_user(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

/// Who a registration secret belongs to
enum Registrant {
    Global,
    User(String),
}

#[derive(Clone)]
pub struct RunnerService {
    store: Arc<dyn JobStore>,
    registration_token: Option<String>,
    access_tokens: Arc<dyn AccessTokenResolver>,
}

impl RunnerService {
    pub fn new(
        store: Arc<dyn JobStore>,
        registration_token: Option<String>,
        access_tokens: Arc<dyn AccessTokenResolver>,
    ) -> Self {
        Self {
            store,
            registration_token,
            access_tokens,
        }
    }

    /// Register a new runner
    ///
    /// The secret must be the global registration token or a user access
    /// token. The returned token is the only credential the runner gets.
    pub async fn register(&self, req: RegisterRunner) -> Result<RegisterRunnerResponse> {
        let registrant = self.validate_secret(&req.token).await?;

        let id = Uuid::new_v4();
        let token = derive_token(id, &req.token);
        let job_type = req.info.requested_job_type().unwrap_or(JobType::All);
        let zone = req
            .info
            .zone
            .clone()
            .unwrap_or_else(|| UNKNOWN_ZONE.to_string());
        let zone = match &registrant {
            Registrant::Global => zone,
            Registrant::User(username) => user_zone(username, &zone),
        };

        let now = Utc::now();
        let runner = Runner {
            id,
            name: req.name,
            token: token.clone(),
            job_type,
            zone,
            active: true,
            contacted_at: now,
            created_at: now,
            version: req.info.version,
            platform: req.info.platform,
            arch: req.info.arch,
            extra: req.info.extra,
        };

        self.store.create_runner(&runner).await?;

        if matches!(registrant, Registrant::Global)
            && self.store.add_known_zone(&runner.zone).await?
        {
            tracing::info!("New job zone registered: {}", runner.zone);
        }

        tracing::info!(
            "Runner registered: {} ({}, zone {})",
            runner.id,
            runner.job_type,
            runner.zone
        );

        Ok(RegisterRunnerResponse {
            token,
            set: RunnerSettings::for_job_type(job_type),
        })
    }

    /// Resolve a bearer token to its runner
    ///
    /// Active runners get `updates` merged in and their contact time bumped.
    /// Inactive runners are returned untouched.
    pub async fn authenticate(&self, token: &str, updates: Option<RunnerInfo>) -> Result<Runner> {
        if token.is_empty() {
            return Err(DispatchError::Forbidden("missing runner token".to_string()));
        }

        let mut runner = self
            .store
            .find_runner_by_token(token)
            .await?
            .ok_or_else(|| DispatchError::Forbidden("invalid runner token".to_string()))?;

        if !runner.active {
            return Ok(runner);
        }

        if let Some(info) = updates {
            runner.apply_info(info);
        }
        runner.contacted_at = Utc::now();
        self.store.save_runner(&runner).await?;

        tracing::debug!("Runner authenticated: {}", runner.id);

        Ok(runner)
    }

    /// Get a runner by ID
    pub async fn get_runner(&self, id: Uuid) -> Result<Runner> {
        self.store
            .find_runner(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Runner {id}")))
    }

    /// List runners with their running job counts
    pub async fn list_runners(&self, query: RunnerQuery) -> Result<Vec<RunnerSummary>> {
        let filter = RunnerFilter {
            job_type: query.job_type,
            active: query.active,
            zone: query.zone,
            online_since: query
                .online
                .map(|online| (online, Utc::now() - Duration::hours(ONLINE_WINDOW_HOURS))),
        };

        let runners = self.store.list_runners(&filter).await?;
        let mut summaries = Vec::with_capacity(runners.len());
        for runner in runners {
            let running = self.store.find_running_by_runner(runner.id).await?.len();
            summaries.push(RunnerSummary::new(runner, running));
        }

        Ok(summaries)
    }

    /// Apply administrative changes to a runner
    pub async fn update_runner(&self, id: Uuid, update: UpdateRunner) -> Result<Runner> {
        let mut runner = self.get_runner(id).await?;

        if let Some(active) = update.active {
            runner.active = active;
        }
        if let Some(job_type) = update.job_type {
            runner.job_type = job_type;
        }
        if let Some(zone) = update.zone {
            runner.zone = zone;
        }

        self.store.save_runner(&runner).await?;

        tracing::info!("Runner updated: {} (active: {})", runner.id, runner.active);

        Ok(runner)
    }

    /// Delete a runner
    pub async fn delete_runner(&self, id: Uuid) -> Result<()> {
        if !self.store.delete_runner(id).await? {
            return Err(DispatchError::NotFound(format!("Runner {id}")));
        }

        tracing::info!("Runner deleted: {}", id);

        Ok(())
    }

    /// Jobs currently running on a runner
    pub async fn running_jobs(&self, id: Uuid) -> Result<Vec<Job>> {
        self.get_runner(id).await?;
        Ok(self.store.find_running_by_runner(id).await?)
    }

    pub async fn known_zones(&self) -> Result<Vec<String>> {
        Ok(self.store.known_zones().await?)
    }

    async fn validate_secret(&self, secret: &str) -> Result<Registrant> {
        if secret.is_empty() {
            return Err(DispatchError::Forbidden(
                "registration token required".to_string(),
            ));
        }

        if self.registration_token.as_deref() == Some(secret) {
            return Ok(Registrant::Global);
        }

        match self.access_tokens.resolve_user(secret).await {
            Some(username) => Ok(Registrant::User(username)),
            None => Err(DispatchError::Forbidden(
                "invalid registration token".to_string(),
            )),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Bearer token handed to a runner: hex SHA-256 of `{id}:{secret}`
pub fn derive_token(id: Uuid, secret: &str) -> String {
    let digest = Sha256::digest(format!("{id}:{secret}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Zone of a runner registered with a user's access token
pub fn user_zone(username: &str, zone: &str) -> String {
    format!("[USER:{username}]-{zone}")
}
