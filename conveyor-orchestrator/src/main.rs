use std::sync::Arc;

use anyhow::Context;
use conveyor_core::domain::job::JobType;
use conveyor_orchestrator::api::{self, AppState};
use conveyor_orchestrator::config::Config;
use conveyor_orchestrator::db;
use conveyor_orchestrator::events::EventBus;
use conveyor_orchestrator::lock::{DispatchLock, MemoryDispatchLock, PgDispatchLock};
use conveyor_orchestrator::metrics::Metrics;
use conveyor_orchestrator::repository::{JobStore, MemoryStore, PgStore};
use conveyor_orchestrator::service::dispatch::DispatcherDeps;
use conveyor_orchestrator::service::{
    Dispatcher, PayloadResolverRegistry, ReaperSweep, StaticAccessTokens,
};
use conveyor_orchestrator::storage::FsBlobStore;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Conveyor Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let (store, lock): (Arc<dyn JobStore>, Arc<dyn DispatchLock>) = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");

            let pool = db::create_pool(database_url)
                .await
                .context("Failed to create database pool")?;

            tracing::info!("Database connection pool created");

            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;

            (
                Arc::new(PgStore::new(pool.clone())),
                Arc::new(PgDispatchLock::new(pool)),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            (
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryDispatchLock::new()),
            )
        }
    };

    // Payload producers live outside the core; hand runners the job reference
    let resolvers = Arc::new(PayloadResolverRegistry::new());
    for job_type in JobType::concrete() {
        resolvers.register(job_type, |entity_id: i64, extra: Option<Value>| async move {
            Ok::<_, anyhow::Error>(json!({ "entity_id": entity_id, "extra": extra }))
        });
    }

    let events = EventBus::new();
    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        DispatcherDeps {
            store: store.clone(),
            blobs: Arc::new(FsBlobStore::new(&config.storage_dir)),
            lock: lock.clone(),
            resolvers,
            access_tokens: Arc::new(StaticAccessTokens::new(config.access_tokens.clone())),
            events: events.clone(),
            metrics: metrics.clone(),
        },
    ));

    let shutdown = CancellationToken::new();
    let reaper = ReaperSweep::new(
        store,
        events,
        metrics,
        config.running_deadline,
        config.reap_interval,
    )
    .with_lock(lock);
    let reaper_handle = tokio::spawn(reaper.run(shutdown.clone()));

    // Build router with all API endpoints
    let app = api::create_router(AppState::new(dispatcher));

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down...");
            signal.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    reaper_handle.await.context("Reaper task failed")?;

    Ok(())
}
