//! Runner-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use conveyor_core::domain::job::Job;
use conveyor_core::domain::runner::{Runner, RunnerInfo};
use conveyor_core::dto::runner::{
    RegisterRunner, RegisterRunnerResponse, RunnerQuery, RunnerSummary, UpdateRunner,
};
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Runner Registration
    // =============================================================================

    /// Register a runner with the orchestrator
    ///
    /// `secret` is the global registration token or a user access token. The
    /// returned token authenticates every later call; pass it to
    /// [`OrchestratorClient::with_token`].
    ///
    /// # Example
    /// ```no_run
    /// # use conveyor_client::OrchestratorClient;
    /// # use conveyor_core::domain::runner::RunnerInfo;
    /// # async fn example() -> conveyor_client::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let info = RunnerInfo {
    ///     zone: Some("eu".to_string()),
    ///     ..Default::default()
    /// };
    /// let registered = client.register("runner-eu-1", "secret", info).await?;
    /// let client = client.with_token(registered.token);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn register(
        &self,
        name: &str,
        secret: &str,
        info: RunnerInfo,
    ) -> Result<RegisterRunnerResponse> {
        let response = self
            .client
            .post(self.url("/api/runners/register"))
            .json(&RegisterRunner {
                name: name.to_string(),
                token: secret.to_string(),
                info,
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Runner Administration
    // =============================================================================

    /// List registered runners matching `query`
    pub async fn list_runners(&self, query: &RunnerQuery) -> Result<Vec<RunnerSummary>> {
        let response = self
            .client
            .get(self.url("/api/runners"))
            .query(query)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get details for a specific runner
    pub async fn get_runner(&self, runner_id: Uuid) -> Result<Runner> {
        let response = self
            .client
            .get(self.url(&format!("/api/runners/{runner_id}")))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Activate, deactivate or reassign a runner
    pub async fn update_runner(&self, runner_id: Uuid, update: &UpdateRunner) -> Result<Runner> {
        let response = self
            .client
            .patch(self.url(&format!("/api/runners/{runner_id}")))
            .json(update)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Delete a runner registration
    pub async fn delete_runner(&self, runner_id: Uuid) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/api/runners/{runner_id}")))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Jobs currently running on a runner
    pub async fn runner_jobs(&self, runner_id: Uuid) -> Result<Vec<Job>> {
        let response = self
            .client
            .get(self.url(&format!("/api/runners/{runner_id}/jobs")))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Zones announced by globally registered runners
    pub async fn known_zones(&self) -> Result<Vec<String>> {
        let response = self.client.get(self.url("/api/zones")).send().await?;

        self.handle_response(response).await
    }
}
