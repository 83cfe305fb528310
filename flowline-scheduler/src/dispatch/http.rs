//! Dispatcher backed by the executor HTTP API

use async_trait::async_trait;
use flowline_core::dto::executor::{CapacityReason, JobHandle, TaskDescriptor};
use flowline_executor::{ClientError, ExecutorClient, SubmitReply};

use super::{DispatchError, Dispatcher, SubmitOutcome};

pub struct HttpDispatcher {
    client: ExecutorClient,
}

impl HttpDispatcher {
    pub fn new(client: ExecutorClient) -> Self {
        Self { client }
    }
}

/// Map a failed submission to what the scheduler should do about it.
///
/// 429 is back-pressure and 408 a timeout: neither says anything about the
/// descriptor, so only the remaining 4xx answers reject the task.
fn classify(error: ClientError) -> Result<SubmitOutcome, DispatchError> {
    match error {
        ClientError::ApiError { status: 429, .. } => {
            Ok(SubmitOutcome::CapacityUnavailable(CapacityReason::NoWorkers))
        }
        ClientError::ApiError { status: 408, .. } => {
            Err(DispatchError::Transport(error.to_string()))
        }
        e if e.is_client_error() => Err(DispatchError::Rejected(e.to_string())),
        e => Err(DispatchError::Transport(e.to_string())),
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn submit(&self, descriptor: TaskDescriptor) -> Result<SubmitOutcome, DispatchError> {
        let reply = match self.client.submit_job(&descriptor).await {
            Ok(reply) => reply,
            Err(e) => return classify(e),
        };
        match reply {
            SubmitReply::Accepted { job_id } => Ok(SubmitOutcome::Submitted(JobHandle {
                job_id,
                run_id: descriptor.run_id,
                node_id: descriptor.node_id,
                attempt: descriptor.attempt,
            })),
            SubmitReply::Unavailable { reason } => Ok(SubmitOutcome::CapacityUnavailable(reason)),
        }
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), DispatchError> {
        self.client
            .cancel_job(&job.job_id)
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))
    }
}
