//! Conveyor HTTP Client
//!
//! A type-safe HTTP client for runners talking to the Conveyor orchestrator.
//!
//! A runner registers once with a registration secret, keeps the returned
//! token and then polls for jobs, reports traces and exchanges artifacts.
//!
//! # Example
//!
//! ```no_run
//! use conveyor_client::OrchestratorClient;
//! use conveyor_core::domain::runner::RunnerInfo;
//!
//! #[tokio::main]
//! async fn main() -> conveyor_client::Result<()> {
//!     let client = OrchestratorClient::new("http://localhost:8080");
//!
//!     let registered = client
//!         .register("runner-eu-1", "registration-secret", RunnerInfo::default())
//!         .await?;
//!     let client = client.with_token(registered.token);
//!
//!     if let Some(job) = client.request_job(None).await?.job {
//!         println!("Got job {}", job.job_id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
mod jobs;
mod runners;

// Re-export commonly used types
pub use conveyor_core::dto::job::{DispatchedJob, JobRequestResponse};
pub use error::{ClientError, Result};

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

/// Header carrying the runner bearer token
pub const RUNNER_TOKEN_HEADER: &str = "x-runner-token";

/// HTTP client for the Conveyor orchestrator API
///
/// Methods are organized into logical groups:
/// - Runner registration and administration
/// - Job polling, trace reports and artifacts
/// - Job creation and queries
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
    /// Runner token obtained at registration
    token: Option<String>,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    ///
    /// # Example
    /// ```
    /// use conveyor_client::OrchestratorClient;
    ///
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new orchestrator client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    ///
    /// # Example
    /// ```
    /// use conveyor_client::OrchestratorClient;
    /// use reqwest::Client;
    /// use std::time::Duration;
    ///
    /// let http_client = Client::builder()
    ///     .timeout(Duration::from_secs(30))
    ///     .build()
    ///     .unwrap();
    ///
    /// let client = OrchestratorClient::with_client("http://localhost:8080", http_client);
    /// ```
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: None,
        }
    }

    /// Use `token` for runner-authenticated calls
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attach the runner token, failing early when none was set
    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.token.as_deref().ok_or(ClientError::MissingToken)?;
        Ok(request.header(RUNNER_TOKEN_HEADER, token))
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code, turning failures into an API error
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response)
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        self.check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content (e.g., DELETE operations)
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        self.check_status(response).await.map(|_| ())
    }
}
