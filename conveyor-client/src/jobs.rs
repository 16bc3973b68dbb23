//! Job-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use conveyor_core::domain::job::Job;
use conveyor_core::domain::runner::RunnerInfo;
use conveyor_core::dto::job::{
    ArtifactUploaded, CreateJob, JobRequestParams, JobRequestResponse, PendingJobCount,
    ProjectUsage,
};
use conveyor_core::dto::trace::{JobTracePage, UpdateJobTrace, UpdateJobTraceResponse};

impl OrchestratorClient {
    // =============================================================================
    // Runner Protocol
    // =============================================================================

    /// Poll for a job
    ///
    /// `info` is merged into the runner record on the orchestrator. The
    /// response carries at most one job plus the settings the runner should
    /// apply.
    pub async fn request_job(&self, info: Option<RunnerInfo>) -> Result<JobRequestResponse> {
        let request = self.client.post(self.url("/api/jobs/request"));
        let response = self
            .authorized(request)?
            .json(&JobRequestParams { info })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Send a trace chunk, and the final status when `report.done` is set
    ///
    /// A `canceled` answer tells the runner to stop working on the job.
    pub async fn report_trace(&self, report: &UpdateJobTrace) -> Result<UpdateJobTraceResponse> {
        tracing::debug!(
            "Reporting {} trace entries for job {} (done: {})",
            report.trace.len(),
            report.job_id,
            report.done
        );

        let request = self.client.post(self.url("/api/jobs/trace"));
        let response = self.authorized(request)?.json(report).send().await?;

        self.handle_response(response).await
    }

    /// Upload an artifact of the runner's current job
    pub async fn upload_artifact(
        &self,
        job_id: i64,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactUploaded> {
        let request = self
            .client
            .post(self.url("/api/jobs/artifacts"))
            .query(&[("jobId", job_id.to_string().as_str()), ("key", key)]);
        tracing::debug!("Uploading artifact {} of job {} ({} bytes)", key, job_id, bytes.len());

        let response = self.authorized(request)?.body(bytes).send().await?;

        self.handle_response(response).await
    }

    /// Download a stored artifact by its full key
    pub async fn download_artifact(&self, key: &str) -> Result<Vec<u8>> {
        let request = self
            .client
            .get(self.url("/api/jobs/artifacts"))
            .query(&[("key", key)]);
        let response = self.authorized(request)?.send().await?;

        let bytes = self.check_status(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    // =============================================================================
    // Job Creation & Queries
    // =============================================================================

    /// Create a batch of jobs
    pub async fn create_jobs(&self, jobs: &[CreateJob]) -> Result<Vec<Job>> {
        let response = self
            .client
            .post(self.url("/api/jobs"))
            .json(jobs)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get a job by ID
    pub async fn get_job(&self, job_id: i64) -> Result<Job> {
        let response = self
            .client
            .get(self.url(&format!("/api/jobs/{job_id}")))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Read a job trace, starting after position `after`
    pub async fn get_trace(&self, job_id: i64, after: Option<i64>) -> Result<JobTracePage> {
        let mut request = self.client.get(self.url(&format!("/api/jobs/{job_id}/trace")));
        if let Some(after) = after {
            request = request.query(&[("after", after)]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    /// Cancel a job that has not finished
    pub async fn cancel_job(&self, job_id: i64) -> Result<Job> {
        let response = self
            .client
            .post(self.url(&format!("/api/jobs/{job_id}/cancel")))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Pending job count per job type
    pub async fn pending_counts(&self) -> Result<Vec<PendingJobCount>> {
        let response = self.client.get(self.url("/api/jobs/pending")).send().await?;

        self.handle_response(response).await
    }

    /// Accumulated job usage of a project
    pub async fn project_usage(&self, project_id: i64) -> Result<ProjectUsage> {
        let response = self
            .client
            .get(self.url(&format!("/api/projects/{project_id}/usage")))
            .send()
            .await?;

        self.handle_response(response).await
    }
}
