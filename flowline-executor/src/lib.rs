//! Flowline executor client
//!
//! A small, type-safe HTTP client for the external job executor. The scheduler
//! uses it to submit and cancel jobs and to poll the executor's event feed.
//!
//! # Example
//!
//! ```no_run
//! use flowline_executor::{ExecutorClient, SubmitReply};
//! # use flowline_core::dto::executor::TaskDescriptor;
//! # async fn example(descriptor: TaskDescriptor) -> flowline_executor::Result<()> {
//! let client = ExecutorClient::new("http://localhost:9090");
//!
//! match client.submit_job(&descriptor).await? {
//!     SubmitReply::Accepted { job_id } => println!("submitted {job_id}"),
//!     SubmitReply::Unavailable { reason } => println!("no capacity: {reason:?}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
mod events;
mod jobs;

pub use error::{ClientError, Result};
pub use jobs::SubmitReply;

use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// HTTP client for the executor API
///
/// - Job lifecycle (submit, cancel)
/// - Event feed (cursor-based polling)
#[derive(Debug, Clone)]
pub struct ExecutorClient {
    /// Base URL of the executor (e.g., "http://localhost:9090")
    base_url: String,
    client: Client,
}

impl ExecutorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Create a client whose requests give up after `timeout`
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = self.error_for_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    async fn error_for_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
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
}
