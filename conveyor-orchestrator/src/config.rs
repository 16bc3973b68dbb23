//! Orchestrator configuration
//!
//! Every knob is read from the environment with a sensible default, so a bare
//! `conveyor-orchestrator` starts an in-memory instance for local testing.

use std::time::Duration;

use conveyor_core::domain::job::UNKNOWN_ZONE;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL; `None` selects the in-memory store and lock
    pub database_url: Option<String>,

    pub bind_addr: String,

    /// Global registration secret. Registrations with it are not user-scoped.
    pub registration_token: Option<String>,

    /// Per-user access tokens accepted at registration, as `(token, username)`
    pub access_tokens: Vec<(String, String)>,

    /// Zone given to jobs created without one
    pub default_job_zone: String,

    /// Dispatch evaluations allowed to run at once
    pub polling_limit: usize,

    /// Extra evaluations allowed to wait for a slot
    pub polling_queue_limit: usize,

    /// Longest wait for a dispatch slot
    pub polling_timeout: Duration,

    /// Timeout handed to runners with each job
    pub execution_timeout: Duration,

    /// How often the reaper runs
    pub reap_interval: Duration,

    /// Running jobs older than this are reaped
    pub running_deadline: Duration,

    pub dispatch_lock_ttl: Duration,

    /// Candidates fetched per dispatch evaluation
    pub dispatch_batch_size: usize,

    /// Root directory of the file blob store
    pub storage_dir: String,

    /// Refuse to hand out jobs
    pub maintenance_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            registration_token: None,
            access_tokens: Vec::new(),
            default_job_zone: UNKNOWN_ZONE.to_string(),
            polling_limit: 10,
            polling_queue_limit: 10,
            polling_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(1800),
            reap_interval: Duration::from_secs(3600),
            running_deadline: Duration::from_secs(3600),
            dispatch_lock_ttl: Duration::from_millis(3000),
            dispatch_batch_size: 20,
            storage_dir: "./data".to_string(),
            maintenance_mode: false,
        }
    }
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Recognized environment variables (all optional):
    /// - DATABASE_URL
    /// - ORCHESTRATOR_BIND_ADDR (default: 0.0.0.0:8080)
    /// - REGISTRATION_TOKEN
    /// - ACCESS_TOKENS (comma separated `token:username` pairs)
    /// - DEFAULT_JOB_ZONE (default: unknown)
    /// - POLLING_LIMIT (default: 10)
    /// - POLLING_QUEUE_LIMIT (default: 10)
    /// - POLLING_TIMEOUT_SEC (default: 5)
    /// - EXECUTION_TIMEOUT_SEC (default: 1800)
    /// - REAP_INTERVAL_SEC (default: 3600)
    /// - RUNNING_DEADLINE_SEC (default: 3600)
    /// - DISPATCH_LOCK_TTL_MS (default: 3000)
    /// - DISPATCH_BATCH_SIZE (default: 20)
    /// - STORAGE_DIR (default: ./data)
    /// - MAINTENANCE_MODE (default: false)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let secs = |name: &str, default: Duration| {
            env_parse::<u64>(name)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let access_tokens = std::env::var("ACCESS_TOKENS")
            .ok()
            .map(|raw| parse_access_tokens(&raw))
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            bind_addr: std::env::var("ORCHESTRATOR_BIND_ADDR").unwrap_or(defaults.bind_addr),
            registration_token: std::env::var("REGISTRATION_TOKEN").ok(),
            access_tokens,
            default_job_zone: std::env::var("DEFAULT_JOB_ZONE")
                .unwrap_or(defaults.default_job_zone),
            polling_limit: env_parse("POLLING_LIMIT").unwrap_or(defaults.polling_limit),
            polling_queue_limit: env_parse("POLLING_QUEUE_LIMIT")
                .unwrap_or(defaults.polling_queue_limit),
            polling_timeout: secs("POLLING_TIMEOUT_SEC", defaults.polling_timeout),
            execution_timeout: secs("EXECUTION_TIMEOUT_SEC", defaults.execution_timeout),
            reap_interval: secs("REAP_INTERVAL_SEC", defaults.reap_interval),
            running_deadline: secs("RUNNING_DEADLINE_SEC", defaults.running_deadline),
            dispatch_lock_ttl: env_parse::<u64>("DISPATCH_LOCK_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.dispatch_lock_ttl),
            dispatch_batch_size: env_parse("DISPATCH_BATCH_SIZE")
                .unwrap_or(defaults.dispatch_batch_size),
            storage_dir: std::env::var("STORAGE_DIR").unwrap_or(defaults.storage_dir),
            maintenance_mode: env_parse("MAINTENANCE_MODE").unwrap_or(defaults.maintenance_mode),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.polling_limit == 0 {
            anyhow::bail!("polling_limit must be greater than 0");
        }

        if self.polling_timeout.is_zero() {
            anyhow::bail!("polling_timeout must be greater than 0");
        }

        if self.reap_interval.is_zero() {
            anyhow::bail!("reap_interval must be greater than 0");
        }

        if self.dispatch_lock_ttl.is_zero() {
            anyhow::bail!("dispatch_lock_ttl must be greater than 0");
        }

        if self.dispatch_batch_size == 0 {
            anyhow::bail!("dispatch_batch_size must be greater than 0");
        }

        if self.registration_token.as_deref().is_some_and(str::is_empty) {
            anyhow::bail!("registration_token cannot be empty when set");
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

fn parse_access_tokens(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (token, username) = pair
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("ACCESS_TOKENS entry must be token:username"))?;
            Ok((token.to_string(), username.to_string()))
        })
        .collect()
}
