//! Job submission and cancellation endpoints

use flowline_core::dto::executor::{CapacityReason, TaskDescriptor};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::ExecutorClient;
use crate::error::{ClientError, Result};

/// Executor answer to a job submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitReply {
    Accepted { job_id: String },
    /// The executor is healthy but cannot take the job right now
    Unavailable { reason: CapacityReason },
}

#[derive(Deserialize)]
struct AcceptedBody {
    job_id: String,
}

#[derive(Deserialize)]
struct UnavailableBody {
    reason: CapacityReason,
}

impl ExecutorClient {
    // =============================================================================
    // Job Lifecycle
    // =============================================================================

    /// Submit one task attempt
    ///
    /// `202 Accepted` carries the job id; `503 Service Unavailable` with a
    /// capacity reason is not an error. Any other status is.
    pub async fn submit_job(&self, descriptor: &TaskDescriptor) -> Result<SubmitReply> {
        let url = format!("{}/v1/jobs", self.base_url);
        let response = self.client.post(&url).json(descriptor).send().await?;

        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            let text = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<UnavailableBody>(&text) {
                Ok(body) => Ok(SubmitReply::Unavailable {
                    reason: body.reason,
                }),
                Err(_) => Err(ClientError::api_error(503, text)),
            };
        }

        let body: AcceptedBody = self.handle_response(response).await?;
        tracing::debug!(
            job_id = %body.job_id,
            node = %descriptor.node_id,
            attempt = descriptor.attempt,
            "Job accepted by executor"
        );
        Ok(SubmitReply::Accepted {
            job_id: body.job_id,
        })
    }

    /// Cancel a job. Cancelling a job the executor no longer knows is a no-op.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let url = format!("{}/v1/jobs/{}", self.base_url, job_id);
        let response = self.client.delete(&url).send().await?;

        match self.error_for_status(response).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    }
}
