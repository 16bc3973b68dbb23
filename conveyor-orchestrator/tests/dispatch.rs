use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conveyor_core::domain::job::{Job, JobStatus, JobType};
use conveyor_core::domain::runner::RunnerInfo;
use conveyor_core::domain::trace::{TraceEntry, TraceLevel};
use conveyor_core::dto::job::CreateJob;
use conveyor_core::dto::runner::{RegisterRunner, RunnerSettings, UpdateRunner};
use conveyor_core::dto::trace::UpdateJobTrace;
use conveyor_orchestrator::config::Config;
use conveyor_orchestrator::events::{EventBus, JobEvent};
use conveyor_orchestrator::lock::{DispatchLock, MemoryDispatchLock};
use conveyor_orchestrator::metrics::{JobOutcome, Metrics};
use conveyor_orchestrator::repository::{JobRepository, JobStore, MemoryStore};
use conveyor_orchestrator::service::dispatch::DispatcherDeps;
use conveyor_orchestrator::service::{
    DispatchError, Dispatcher, PayloadResolverRegistry, StaticAccessTokens,
};
use conveyor_orchestrator::storage::{BlobStore, MemoryBlobStore};
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;

const SECRET: &str = "registration-secret";
const ALICE_TOKEN: &str = "alice-access-token";

struct Harness {
    dispatcher: Arc<Dispatcher>,
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStore>,
    lock: Arc<MemoryDispatchLock>,
    events: EventBus,
}

fn config() -> Config {
    Config {
        registration_token: Some(SECRET.to_string()),
        ..Default::default()
    }
}

fn passthrough_resolvers() -> Arc<PayloadResolverRegistry> {
    let resolvers = Arc::new(PayloadResolverRegistry::new());
    for job_type in JobType::concrete() {
        resolvers.register(job_type, |entity_id: i64, _extra: Option<Value>| async move {
            Ok::<_, anyhow::Error>(json!({ "entity_id": entity_id }))
        });
    }
    resolvers
}

fn dispatcher_on(
    config: &Config,
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStore>,
    lock: Arc<MemoryDispatchLock>,
    resolvers: Arc<PayloadResolverRegistry>,
    events: EventBus,
) -> Dispatcher {
    let store: Arc<dyn JobStore> = store;
    let lock: Arc<dyn DispatchLock> = lock;
    Dispatcher::new(
        config,
        DispatcherDeps {
            store,
            blobs,
            lock,
            resolvers,
            access_tokens: Arc::new(StaticAccessTokens::new([(
                ALICE_TOKEN.to_string(),
                "alice".to_string(),
            )])),
            events,
            metrics: Arc::new(Metrics::new().unwrap()),
        },
    )
}

fn harness_on(config: &Config, resolvers: Arc<PayloadResolverRegistry>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let lock = Arc::new(MemoryDispatchLock::new());
    let events = EventBus::new();
    let dispatcher = dispatcher_on(
        config,
        store.clone(),
        blobs.clone(),
        lock.clone(),
        resolvers,
        events.clone(),
    );

    Harness {
        dispatcher: Arc::new(dispatcher),
        store,
        blobs,
        lock,
        events,
    }
}

fn harness_with(resolvers: Arc<PayloadResolverRegistry>) -> Harness {
    harness_on(&config(), resolvers)
}

fn harness() -> Harness {
    harness_with(passthrough_resolvers())
}

async fn register(dispatcher: &Dispatcher, zone: &str, job_type: &str) -> String {
    register_with(dispatcher, SECRET, zone, job_type).await
}

async fn register_with(
    dispatcher: &Dispatcher,
    secret: &str,
    zone: &str,
    job_type: &str,
) -> String {
    dispatcher
        .runners()
        .register(RegisterRunner {
            name: format!("{zone}-{job_type}"),
            token: secret.to_string(),
            info: RunnerInfo {
                zone: Some(zone.to_string()),
                extra: Some(HashMap::from([(
                    "jobType".to_string(),
                    job_type.to_string(),
                )])),
                ..Default::default()
            },
        })
        .await
        .unwrap()
        .token
}

async fn create(dispatcher: &Dispatcher, job_type: JobType, zone: &str, entity_id: i64) -> Job {
    dispatcher
        .jobs()
        .create_job(CreateJob {
            job_type,
            project_id: 1,
            entity_id,
            zone: Some(zone.to_string()),
            extra: None,
        })
        .await
        .unwrap()
}

/// A pending job with a chosen id, as if its insert committed just now
fn pending_job(id: i64, job_type: JobType, zone: &str) -> Job {
    Job {
        id,
        iid: id,
        project_id: 1,
        job_type,
        entity_id: id,
        zone: zone.to_string(),
        status: JobStatus::Pending,
        runner_id: None,
        created_at: Utc::now(),
        started_at: None,
        ended_at: None,
        duration: None,
        extra: None,
    }
}

async fn status(store: &MemoryStore, id: i64) -> JobStatus {
    store.find_job(id).await.unwrap().unwrap().status
}

fn entry(ts: i64, message: &str) -> TraceEntry {
    TraceEntry::new(TraceLevel::Info, ts, message)
}

fn report(job_id: i64, trace: Vec<TraceEntry>, done: bool) -> UpdateJobTrace {
    UpdateJobTrace {
        job_id,
        trace,
        done,
        duration: done.then_some(1500),
        failed_reason: None,
        job_updates: None,
    }
}

// =============================================================================
// Job requests
// =============================================================================

#[tokio::test]
async fn test_runner_gets_lowest_eligible_job_in_its_zone() {
    let h = harness();
    let token = register(&h.dispatcher, "eu", "BundleAnalyze").await;

    let first = create(&h.dispatcher, JobType::BundleAnalyze, "eu", 10).await;
    let second = create(&h.dispatcher, JobType::BundleAnalyze, "eu", 11).await;
    let foreign = create(&h.dispatcher, JobType::BundleAnalyze, "us", 12).await;

    let res = h.dispatcher.request_job(&token, None).await.unwrap();

    let job = res.job.expect("a job is dispatched");
    assert_eq!(job.job_id, first.id);
    assert_eq!(job.job_type, JobType::BundleAnalyze);
    assert_eq!(job.payload, json!({ "entity_id": 10 }));
    assert_eq!(job.timeout, 1800);
    assert_eq!(res.set, Some(RunnerSettings::for_job_type(JobType::BundleAnalyze)));

    assert_eq!(status(&h.store, first.id).await, JobStatus::Running);
    assert_eq!(status(&h.store, second.id).await, JobStatus::Pending);
    assert_eq!(status(&h.store, foreign.id).await, JobStatus::Pending);
}

#[tokio::test]
async fn test_runner_only_sees_its_job_type_group() {
    let h = harness();
    let token = register(&h.dispatcher, "eu", "LabAnalyze").await;

    create(&h.dispatcher, JobType::BundleAnalyze, "eu", 1).await;
    let ping = create(&h.dispatcher, JobType::LabPing, "eu", 2).await;

    let res = h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(res.job.unwrap().job_id, ping.id);

    let res = h.dispatcher.request_job(&token, None).await.unwrap();
    assert!(res.job.is_none());
    assert!(res.set.is_some());
}

#[tokio::test]
async fn test_unknown_zone_runner_takes_jobs_from_any_zone() {
    let h = harness();
    let token = register(&h.dispatcher, "unknown", "All").await;

    let us = create(&h.dispatcher, JobType::SourceAnalyze, "us", 1).await;

    let res = h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(res.job.unwrap().job_id, us.id);
}

#[tokio::test]
async fn test_inactive_runner_and_maintenance_get_empty_answers() {
    let h = harness();
    let token = register(&h.dispatcher, "eu", "All").await;
    let job = create(&h.dispatcher, JobType::LabPing, "eu", 1).await;

    h.dispatcher.set_maintenance(true);
    let res = h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(res, Default::default());
    h.dispatcher.set_maintenance(false);

    let runner = h.dispatcher.runners().authenticate(&token, None).await.unwrap();
    h.dispatcher
        .runners()
        .update_runner(
            runner.id,
            UpdateRunner {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let res = h.dispatcher.request_job(&token, None).await.unwrap();
    assert!(res.job.is_none());
    assert!(res.set.is_none());
    assert_eq!(status(&h.store, job.id).await, JobStatus::Pending);
}

#[tokio::test]
async fn test_unknown_token_is_forbidden() {
    let h = harness();
    assert!(matches!(
        h.dispatcher.request_job("nope", None).await,
        Err(DispatchError::Forbidden(_))
    ));
}

#[tokio::test]
async fn test_locked_job_is_skipped() {
    let h = harness();
    let token = register(&h.dispatcher, "eu", "All").await;
    let held = create(&h.dispatcher, JobType::LabPing, "eu", 1).await;
    let free = create(&h.dispatcher, JobType::LabPing, "eu", 2).await;

    // Another instance is in the middle of claiming the first job
    assert!(
        h.lock
            .try_acquire(&format!("dispatch:job:{}", held.id), std::time::Duration::from_secs(3))
            .await
            .unwrap()
    );

    let res = h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(res.job.unwrap().job_id, free.id);
    assert_eq!(status(&h.store, held.id).await, JobStatus::Pending);
}

#[tokio::test]
async fn test_payload_failure_seals_job_and_moves_on() {
    let resolvers = passthrough_resolvers();
    resolvers.register(JobType::LabPing, |entity_id: i64, _: Option<Value>| async move {
        if entity_id == 1 {
            anyhow::bail!("entity {entity_id} is gone");
        }
        Ok(json!({ "entity_id": entity_id }))
    });
    let h = harness_with(resolvers);
    let mut rx = h.events.subscribe();

    let token = register(&h.dispatcher, "eu", "LabAnalyze").await;
    let broken = create(&h.dispatcher, JobType::LabPing, "eu", 1).await;
    let healthy = create(&h.dispatcher, JobType::LabPing, "eu", 2).await;

    let res = h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(res.job.unwrap().job_id, healthy.id);

    let sealed = h.store.find_job(broken.id).await.unwrap().unwrap();
    assert_eq!(sealed.status, JobStatus::Done);
    assert!(sealed.ended_at.is_some());
    assert_eq!(
        h.dispatcher.metrics().jobs(JobType::LabPing, JobOutcome::Failed),
        1
    );

    let trace = h.dispatcher.traces().get_trace(&sealed, None).await.unwrap();
    assert_eq!(trace.entries.len(), 1);
    assert_eq!(trace.entries[0].level, TraceLevel::Error);
    assert_eq!(trace.entries[0].message, "Failed to fetch job payload.");
    assert_eq!(trace.entries[0].details, vec![json!("entity 1 is gone")]);

    match rx.try_recv().unwrap() {
        JobEvent::Error {
            job_id, entity_id, ..
        } => {
            assert_eq!(job_id, broken.id);
            assert_eq!(entity_id, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_watermark_comes_from_full_scans() {
    let h = harness();
    let token = register(&h.dispatcher, "eu", "BundleAnalyze").await;
    for entity_id in 0..3 {
        create(&h.dispatcher, JobType::BundleAnalyze, "eu", entity_id).await;
    }

    h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(h.dispatcher.watermarks().get(JobType::BundleAnalyze, "eu"), None);

    h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(h.dispatcher.watermarks().get(JobType::BundleAnalyze, "eu"), Some(1));

    // A bounded scan leaves the bound alone
    let last = h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(last.job.unwrap().job_id, 3);
    assert_eq!(h.dispatcher.watermarks().get(JobType::BundleAnalyze, "eu"), Some(1));

    let late = create(&h.dispatcher, JobType::BundleAnalyze, "eu", 9).await;
    let res = h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(res.job.unwrap().job_id, late.id);
}

#[tokio::test]
async fn test_job_committed_below_watermark_is_dispatched() {
    let h = harness();
    let token = register(&h.dispatcher, "eu", "BundleAnalyze").await;

    // Id 10 was allocated first but its insert commits after id 11
    h.store.put_job(pending_job(11, JobType::BundleAnalyze, "eu"));
    let first = h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(first.job.unwrap().job_id, 11);
    assert_eq!(h.dispatcher.watermarks().get(JobType::BundleAnalyze, "eu"), Some(10));

    h.store.put_job(pending_job(10, JobType::BundleAnalyze, "eu"));
    let second = h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(second.job.map(|job| job.job_id), Some(10));
    assert_eq!(status(&h.store, 10).await, JobStatus::Running);
}

#[tokio::test]
async fn test_user_runner_stays_in_its_namespace() {
    let h = harness();
    let token = register_with(&h.dispatcher, ALICE_TOKEN, "eu", "All").await;

    let foreign = create(&h.dispatcher, JobType::LabPing, "eu", 1).await;
    let own = create(&h.dispatcher, JobType::LabPing, "[USER:alice]-eu", 2).await;

    // Runners report their configured zone on every poll
    let info = RunnerInfo {
        zone: Some("eu".to_string()),
        ..Default::default()
    };
    let res = h.dispatcher.request_job(&token, Some(info.clone())).await.unwrap();
    assert_eq!(res.job.unwrap().job_id, own.id);

    let res = h.dispatcher.request_job(&token, Some(info)).await.unwrap();
    assert!(res.job.is_none());
    assert_eq!(status(&h.store, foreign.id).await, JobStatus::Pending);

    let runner = h.dispatcher.runners().authenticate(&token, None).await.unwrap();
    assert_eq!(runner.zone, "[USER:alice]-eu");
}

#[tokio::test(start_paused = true)]
async fn test_saturated_admission_answers_without_job() {
    let config = Config {
        polling_limit: 1,
        polling_queue_limit: 0,
        polling_timeout: Duration::from_secs(5),
        ..config()
    };
    let h = harness_on(&config, passthrough_resolvers());
    let token = register(&h.dispatcher, "eu", "All").await;
    let job = create(&h.dispatcher, JobType::LabPing, "eu", 1).await;

    let held = h.dispatcher.queue().acquire().await.unwrap();

    let res = h.dispatcher.request_job(&token, None).await.unwrap();
    assert!(res.job.is_none());
    assert_eq!(res.set, Some(RunnerSettings::for_job_type(JobType::All)));
    assert_eq!(h.dispatcher.metrics().backpressure_rejections(), 1);
    assert_eq!(status(&h.store, job.id).await, JobStatus::Pending);

    drop(held);
    let res = h.dispatcher.request_job(&token, None).await.unwrap();
    assert_eq!(res.job.unwrap().job_id, job.id);
    assert_eq!(h.dispatcher.metrics().backpressure_rejections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_admission_timeout_answers_without_job() {
    let config = Config {
        polling_limit: 1,
        polling_queue_limit: 1,
        polling_timeout: Duration::from_secs(5),
        ..config()
    };
    let h = harness_on(&config, passthrough_resolvers());
    let token = register(&h.dispatcher, "eu", "All").await;
    create(&h.dispatcher, JobType::LabPing, "eu", 1).await;

    let _held = h.dispatcher.queue().acquire().await.unwrap();

    let started = tokio::time::Instant::now();
    let res = h.dispatcher.request_job(&token, None).await.unwrap();
    assert!(res.job.is_none());
    assert!(res.set.is_some());
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(h.dispatcher.metrics().backpressure_rejections(), 1);

    // Only the held slot is left in the queue
    assert_eq!(h.dispatcher.queue().waiting(), 1);
    assert_eq!(h.dispatcher.queue().accepted(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatchers_claim_a_job_once() {
    const DISPATCHERS: usize = 8;

    let store = Arc::new(MemoryStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let lock = Arc::new(MemoryDispatchLock::new());

    let dispatchers: Vec<Arc<Dispatcher>> = (0..DISPATCHERS)
        .map(|_| {
            Arc::new(dispatcher_on(
                &config(),
                store.clone(),
                blobs.clone(),
                lock.clone(),
                passthrough_resolvers(),
                EventBus::new(),
            ))
        })
        .collect();

    let mut tokens = Vec::new();
    for dispatcher in &dispatchers {
        tokens.push(register(dispatcher, "eu", "All").await);
    }
    let job = create(&dispatchers[0], JobType::PackageAnalyze, "eu", 1).await;

    let barrier = Arc::new(tokio::sync::Barrier::new(DISPATCHERS));
    let mut handles = Vec::new();
    for (dispatcher, token) in dispatchers.into_iter().zip(tokens) {
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            dispatcher.request_job(&token, None).await.unwrap().job
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            claimed.push(job.job_id);
        }
    }

    assert_eq!(claimed, vec![job.id]);
    let job = store.find_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.runner_id.is_some());
}

// =============================================================================
// Trace reports
// =============================================================================

async fn running_job(h: &Harness) -> (String, Job) {
    let token = register(&h.dispatcher, "eu", "All").await;
    create(&h.dispatcher, JobType::LabAnalyze, "eu", 1).await;
    let id = h
        .dispatcher
        .request_job(&token, None)
        .await
        .unwrap()
        .job
        .unwrap()
        .job_id;
    let job = h.store.find_job(id).await.unwrap().unwrap();
    (token, job)
}

#[tokio::test]
async fn test_trace_resend_is_not_duplicated() {
    let h = harness();
    let (token, job) = running_job(&h).await;
    let chunk = vec![entry(100, "start"), entry(200, "step")];

    h.dispatcher
        .update_trace(&token, report(job.id, chunk.clone(), false))
        .await
        .unwrap();
    h.dispatcher
        .update_trace(&token, report(job.id, chunk, false))
        .await
        .unwrap();
    h.dispatcher
        .update_trace(&token, report(job.id, vec![entry(300, "end")], true))
        .await
        .unwrap();

    let done = h.store.find_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(done.duration, Some(1500));

    let page = h.dispatcher.traces().get_trace(&done, None).await.unwrap();
    let messages: Vec<&str> = page.entries.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["start", "step", "end"]);
    assert!(!page.has_more);
    assert_eq!(
        h.dispatcher
            .metrics()
            .jobs(JobType::LabAnalyze, JobOutcome::Succeeded),
        1
    );
    assert_eq!(h.store.project_usage(1).await.unwrap().job_duration_ms, 1500);
}

#[tokio::test]
async fn test_failed_reason_marks_job_failed() {
    let h = harness();
    let mut rx = h.events.subscribe();
    let (token, job) = running_job(&h).await;

    let mut params = report(job.id, vec![entry(1, "boom")], true);
    params.failed_reason = Some("exit code 1".to_string());
    let res = h.dispatcher.update_trace(&token, params).await.unwrap();
    assert!(!res.canceled);

    assert_eq!(status(&h.store, job.id).await, JobStatus::Failed);
    assert_eq!(
        h.dispatcher
            .metrics()
            .jobs(JobType::LabAnalyze, JobOutcome::Failed),
        1
    );

    let mut reasons = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let JobEvent::Error { reason, .. } = event {
            reasons.push(reason);
        }
    }
    assert_eq!(reasons, vec!["exit code 1".to_string()]);
}

#[tokio::test]
async fn test_completion_of_sealed_job_is_ignored() {
    let h = harness();
    let (token, job) = running_job(&h).await;

    h.dispatcher
        .update_trace(&token, report(job.id, Vec::new(), true))
        .await
        .unwrap();
    let mut late = report(job.id, Vec::new(), true);
    late.failed_reason = Some("late".to_string());
    h.dispatcher.update_trace(&token, late).await.unwrap();

    assert_eq!(status(&h.store, job.id).await, JobStatus::Done);
    assert_eq!(h.store.project_usage(1).await.unwrap().job_duration_ms, 1500);
}

#[tokio::test]
async fn test_canceled_job_declines_trace() {
    let h = harness();
    let (token, job) = running_job(&h).await;
    h.dispatcher.jobs().cancel_job(job.id).await.unwrap();

    let res = h
        .dispatcher
        .update_trace(&token, report(job.id, vec![entry(1, "ignored")], true))
        .await
        .unwrap();
    assert!(res.canceled);

    let canceled = h.store.find_job(job.id).await.unwrap().unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);
    assert!(matches!(
        h.dispatcher.traces().get_trace(&canceled, None).await,
        Err(DispatchError::TraceExpired)
    ));
}

#[tokio::test]
async fn test_trace_from_another_runner_is_forbidden() {
    let h = harness();
    let (_, job) = running_job(&h).await;
    let intruder = register(&h.dispatcher, "eu", "All").await;

    assert!(matches!(
        h.dispatcher
            .update_trace(&intruder, report(job.id, vec![entry(1, "x")], false))
            .await,
        Err(DispatchError::Forbidden(_))
    ));
    assert!(matches!(
        h.dispatcher
            .update_trace(&intruder, report(999, Vec::new(), false))
            .await,
        Err(DispatchError::NotFound(_))
    ));
}

// =============================================================================
// Artifacts
// =============================================================================

#[tokio::test]
async fn test_artifact_upload_and_download() {
    let h = harness();
    let mut rx = h.events.subscribe();
    let (token, job) = running_job(&h).await;

    let uploaded = h
        .dispatcher
        .upload_artifact(&token, &job.id.to_string(), "report.json", b"{}".to_vec())
        .await
        .unwrap();
    assert_eq!(uploaded.key, "artifacts/1/report.json");
    assert_eq!(uploaded.size, 2);
    assert!(h.blobs.contains("artifacts/1/report.json"));

    let mut reader = h
        .dispatcher
        .download_artifact(&token, &uploaded.key)
        .await
        .unwrap();
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"{}");

    let mut uploads = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let JobEvent::Upload {
            entity_id, size, ..
        } = &event
        {
            uploads.push((event.topic(), *entity_id, *size));
        }
    }
    assert_eq!(uploads, vec![("LabAnalyze.upload".to_string(), 1, 2)]);
}

#[tokio::test]
async fn test_artifact_access_checks() {
    let h = harness();
    let (token, job) = running_job(&h).await;
    let intruder = register(&h.dispatcher, "eu", "All").await;

    assert!(matches!(
        h.dispatcher
            .upload_artifact(&token, "not-a-number", "a.txt", Vec::new())
            .await,
        Err(DispatchError::Forbidden(_))
    ));
    assert!(matches!(
        h.dispatcher
            .upload_artifact(&intruder, &job.id.to_string(), "a.txt", Vec::new())
            .await,
        Err(DispatchError::Forbidden(_))
    ));
    assert!(matches!(
        h.dispatcher.download_artifact(&token, "artifacts/1/missing").await,
        Err(DispatchError::NotFound(_))
    ));
    assert!(
        h.blobs
            .get("artifacts/1/a.txt")
            .await
            .is_err()
    );
}
