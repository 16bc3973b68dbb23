//! Dispatch metrics
//!
//! Prometheus collectors for the job lifecycle and the dispatch loop, labelled
//! by job type. `GET /api/metrics` renders the registry in the text format.

use std::time::Duration;

use conveyor_core::domain::job::JobType;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Lifecycle step counted in `conveyor_jobs_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Created,
    Dispatched,
    Succeeded,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Created => "created",
            JobOutcome::Dispatched => "dispatched",
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed => "failed",
        }
    }
}

pub struct Metrics {
    registry: Registry,
    jobs_total: IntCounterVec,
    pending_time: HistogramVec,
    dispatch_duration: HistogramVec,
    backpressure_rejections: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let metrics = Self {
            registry: Registry::new(),

            jobs_total: IntCounterVec::new(
                Opts::new(
                    "conveyor_jobs_total",
                    "Jobs per type and lifecycle step",
                ),
                &["job_type", "outcome"],
            )?,

            pending_time: HistogramVec::new(
                HistogramOpts::new(
                    "conveyor_job_pending_seconds",
                    "Time between job creation and dispatch",
                )
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
                &["job_type"],
            )?,

            dispatch_duration: HistogramVec::new(
                HistogramOpts::new(
                    "conveyor_dispatch_duration_seconds",
                    "Duration of a job request, admission wait included",
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
                &["found"],
            )?,

            backpressure_rejections: IntCounter::new(
                "conveyor_backpressure_rejections_total",
                "Job requests refused by the admission queue",
            )?,
        };

        metrics.register()?;
        Ok(metrics)
    }

    fn register(&self) -> prometheus::Result<()> {
        self.registry.register(Box::new(self.jobs_total.clone()))?;
        self.registry.register(Box::new(self.pending_time.clone()))?;
        self.registry
            .register(Box::new(self.dispatch_duration.clone()))?;
        self.registry
            .register(Box::new(self.backpressure_rejections.clone()))?;
        Ok(())
    }

    fn count(&self, job_type: JobType, outcome: JobOutcome) {
        self.jobs_total
            .with_label_values(&[job_type.as_str(), outcome.as_str()])
            .inc();
    }

    pub fn job_created(&self, job_type: JobType) {
        self.count(job_type, JobOutcome::Created);
    }

    pub fn job_succeeded(&self, job_type: JobType) {
        self.count(job_type, JobOutcome::Succeeded);
    }

    pub fn job_failed(&self, job_type: JobType) {
        self.count(job_type, JobOutcome::Failed);
    }

    /// A job left `Pending` after `pending_ms`
    pub fn pending_time(&self, job_type: JobType, pending_ms: i64) {
        self.count(job_type, JobOutcome::Dispatched);
        self.pending_time
            .with_label_values(&[job_type.as_str()])
            .observe(pending_ms.max(0) as f64 / 1000.0);
    }

    pub fn dispatch_duration(&self, elapsed: Duration, found: bool) {
        let found = if found { "true" } else { "false" };
        self.dispatch_duration
            .with_label_values(&[found])
            .observe(elapsed.as_secs_f64());
    }

    pub fn backpressure(&self) {
        self.backpressure_rejections.inc();
    }

    pub fn jobs(&self, job_type: JobType, outcome: JobOutcome) -> u64 {
        self.jobs_total
            .with_label_values(&[job_type.as_str(), outcome.as_str()])
            .get()
    }

    pub fn backpressure_rejections(&self) -> u64 {
        self.backpressure_rejections.get()
    }

    /// Observed pending times of a job type, with their sum in seconds
    pub fn pending_samples(&self, job_type: JobType) -> (u64, f64) {
        let histogram = self.pending_time.with_label_values(&[job_type.as_str()]);
        (histogram.get_sample_count(), histogram.get_sample_sum())
    }

    /// Every collector in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_labelled_by_job_type() {
        let metrics = Metrics::new().unwrap();

        metrics.job_created(JobType::LabPing);
        metrics.job_created(JobType::LabPing);
        metrics.job_failed(JobType::BundleAnalyze);

        assert_eq!(metrics.jobs(JobType::LabPing, JobOutcome::Created), 2);
        assert_eq!(metrics.jobs(JobType::BundleAnalyze, JobOutcome::Created), 0);
        assert_eq!(metrics.jobs(JobType::BundleAnalyze, JobOutcome::Failed), 1);
    }

    #[test]
    fn test_pending_time_is_recorded() {
        let metrics = Metrics::new().unwrap();

        metrics.pending_time(JobType::LabAnalyze, 1500);
        metrics.pending_time(JobType::LabAnalyze, 500);

        let (count, sum) = metrics.pending_samples(JobType::LabAnalyze);
        assert_eq!(count, 2);
        assert!((sum - 2.0).abs() < f64::EPSILON);
        assert_eq!(metrics.jobs(JobType::LabAnalyze, JobOutcome::Dispatched), 2);
    }

    #[test]
    fn test_render_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.job_succeeded(JobType::SourceAnalyze);
        metrics.dispatch_duration(Duration::from_millis(20), true);
        metrics.backpressure();

        let text = metrics.render().unwrap();
        assert!(text.contains(
            r#"conveyor_jobs_total{job_type="SourceAnalyze",outcome="succeeded"} 1"#
        ));
        assert!(text.contains(r#"conveyor_dispatch_duration_seconds_count{found="true"} 1"#));
        assert!(text.contains("conveyor_backpressure_rejections_total 1"));
    }
}
