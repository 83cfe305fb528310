//! Dispatch Client
//!
//! Turns a claimed task into a job submission for the external executor.
//! Capacity shortage is an outcome, not an error. Every call is bounded by
//! [`TimeoutDispatcher`].

mod http;

pub use http::HttpDispatcher;

use std::time::Duration;

use async_trait::async_trait;
use flowline_core::dag::DagNode;
use flowline_core::domain::run::{ClusterSelection, Run};
use flowline_core::domain::task::Task;
use flowline_core::dto::executor::{CapacityReason, JobHandle, ResolvedInput, TaskDescriptor};
use thiserror::Error;

use crate::repository::RunSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted(JobHandle),
    CapacityUnavailable(CapacityReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The executor refused the job; resubmitting the same descriptor will not help
    #[error("job rejected: {0}")]
    Rejected(String),

    /// The executor could not be reached or did not answer
    #[error("executor unreachable: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn submit(&self, descriptor: TaskDescriptor) -> Result<SubmitOutcome, DispatchError>;

    async fn cancel(&self, job: &JobHandle) -> Result<(), DispatchError>;
}

/// Bounds every executor call with a deadline.
///
/// A submission that times out is reported as capacity unavailable. A
/// cancellation that times out is a transport error.
pub struct TimeoutDispatcher<D> {
    inner: D,
    submit_timeout: Duration,
    cancel_timeout: Duration,
}

impl<D: Dispatcher> TimeoutDispatcher<D> {
    pub fn new(inner: D, submit_timeout: Duration, cancel_timeout: Duration) -> Self {
        Self {
            inner,
            submit_timeout,
            cancel_timeout,
        }
    }
}

#[async_trait]
impl<D: Dispatcher> Dispatcher for TimeoutDispatcher<D> {
    async fn submit(&self, descriptor: TaskDescriptor) -> Result<SubmitOutcome, DispatchError> {
        let node = descriptor.node_id.clone();
        match tokio::time::timeout(self.submit_timeout, self.inner.submit(descriptor)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(node = %node, timeout = ?self.submit_timeout, "Job submission timed out");
                Ok(SubmitOutcome::CapacityUnavailable(CapacityReason::Timeout))
            }
        }
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), DispatchError> {
        tokio::time::timeout(self.cancel_timeout, self.inner.cancel(job))
            .await
            .map_err(|_| DispatchError::Transport(format!("cancel of {} timed out", job.job_id)))?
    }
}

/// Build the submission for `task`, resolving each input against the outputs
/// of its upstream task in the same snapshot.
pub fn build_descriptor(
    run: &Run,
    node: &DagNode,
    task: &Task,
    snapshot: &RunSnapshot,
) -> Result<TaskDescriptor, DispatchError> {
    let mut inputs = Vec::with_capacity(node.spec.inputs.len());
    for input in &node.spec.inputs {
        let reference = snapshot
            .task(&input.from_node)
            .and_then(|upstream| upstream.outputs.as_ref())
            .and_then(|outputs| outputs.get(&input.output))
            .ok_or_else(|| {
                DispatchError::Rejected(format!(
                    "input '{}' needs output '{}' of '{}', which was not produced",
                    input.name, input.output, input.from_node
                ))
            })?;
        inputs.push(ResolvedInput {
            name: input.name.clone(),
            from_node: input.from_node.clone(),
            output: input.output.clone(),
            reference: reference.clone(),
        });
    }

    let worker_type = match run.cluster_selection {
        ClusterSelection::OnDemand => node.spec.worker_type.clone(),
        ClusterSelection::Static => None,
    };

    Ok(TaskDescriptor {
        run_id: run.id,
        project_id: run.project_id,
        user_id: run.user_id,
        node_id: task.node_id.clone(),
        attempt: task.attempt_count,
        image: node.spec.image.clone(),
        resources: task.resources.clone(),
        inputs,
        params: node.spec.params.clone(),
        cluster: run.cluster_selection,
        worker_type,
    })
}
