//! Reconciler
//!
//! Applies executor-reported outcomes to task state. Events are matched to
//! the task's current attempt; anything about an older attempt, another job,
//! or an already finished task is dropped. Where the outcome can unblock or
//! finish the run, a scheduler pass is requested.
//!
//! Where events come from is abstracted behind [`CompletionSource`]: the
//! executor feed can be polled ([`PollingSource`]) or pushed into a channel
//! ([`ChannelSource`]).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_core::dag::PipelineDag;
use flowline_core::domain::task::{FailureClass, Task, TaskError, TaskKey, TaskState};
use flowline_core::dto::executor::{EventKind, ExecutorEvent};
use flowline_executor::{ClientError, ExecutorClient};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::cancellation::abort_downstream;
use crate::context::SchedulerContext;
use crate::repository::{CasOutcome, Expected, RepositoryError, TaskUpdate};

/// Re-reads allowed when a compare-and-set loses a race
const CAS_ATTEMPTS: usize = 3;

/// Most events taken from a channel in one batch
const CHANNEL_BATCH: usize = 256;

/// What applying one event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Progress or heartbeat stored, no state change
    Recorded,
    Transitioned(TaskState),
    /// Event is about another attempt, another job or a finished task
    Stale,
    /// Kept losing compare-and-set races; the sweep will catch up
    Contended,
}

pub struct Reconciler {
    ctx: SchedulerContext,
}

impl Reconciler {
    pub fn new(ctx: SchedulerContext) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, event), fields(job_id = %event.job.job_id, node = %event.job.node_id, attempt = event.job.attempt))]
    pub async fn apply(&self, event: &ExecutorEvent) -> Result<EventOutcome, RepositoryError> {
        let key = TaskKey::new(event.job.run_id, event.job.node_id.clone());

        for _ in 0..CAS_ATTEMPTS {
            let Some(task) = self.ctx.repository.get_task(&key).await? else {
                return Ok(EventOutcome::Stale);
            };
            if !self.is_current(&task, event) {
                debug!(state = %task.state, current_attempt = task.attempt_count, "Dropping stale event");
                return Ok(EventOutcome::Stale);
            }

            let outcome = match &event.kind {
                EventKind::Progress { progress } => {
                    self.on_liveness(&task, Some(*progress), event.at).await?
                }
                EventKind::Heartbeat => self.on_liveness(&task, None, event.at).await?,
                EventKind::Succeeded { outputs } => {
                    if !task.state.is_in_flight() {
                        return Ok(EventOutcome::Stale);
                    }
                    self.transition(
                        &task,
                        TaskState::Success,
                        TaskUpdate::outputs(outputs.clone()),
                    )
                    .await?
                }
                EventKind::Failed {
                    class,
                    message,
                    logs_ref,
                } => {
                    let error = TaskError {
                        class: *class,
                        message: message.clone(),
                        logs_ref: logs_ref.clone(),
                    };
                    self.on_failure(&task, error).await?
                }
                EventKind::HeartbeatLost => {
                    let error = TaskError {
                        class: FailureClass::HeartbeatLost,
                        message: "executor lost the worker heartbeat".to_string(),
                        logs_ref: None,
                    };
                    self.on_failure(&task, error).await?
                }
                EventKind::Lost => self.on_lost(&task).await?,
            };

            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
        }

        warn!("Giving up on event after repeated conflicts");
        Ok(EventOutcome::Contended)
    }

    fn is_current(&self, task: &Task, event: &ExecutorEvent) -> bool {
        if task.state.is_terminal() || task.attempt_count != event.job.attempt {
            return false;
        }
        match &task.job_id {
            Some(job_id) => *job_id == event.job.job_id,
            // Events can beat the scheduler recording the job id
            None => true,
        }
    }

    /// Progress and heartbeats. The first one moves a `PENDING` task to `STARTED`.
    async fn on_liveness(
        &self,
        task: &Task,
        progress: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<Option<EventOutcome>, RepositoryError> {
        match task.state {
            TaskState::Pending | TaskState::Unknown => {
                let update = TaskUpdate {
                    progress,
                    heartbeat_at: Some(at),
                    ..TaskUpdate::none()
                };
                self.transition(task, TaskState::Started, update).await
            }
            TaskState::Started => {
                let recorded = self
                    .ctx
                    .repository
                    .upsert_task_progress(&task.key(), task.attempt_count, progress, at)
                    .await?;
                Ok(Some(if recorded {
                    EventOutcome::Recorded
                } else {
                    EventOutcome::Stale
                }))
            }
            _ => Ok(Some(EventOutcome::Stale)),
        }
    }

    /// The executor no longer knows the job. The sweep decides what happens next.
    async fn on_lost(&self, task: &Task) -> Result<Option<EventOutcome>, RepositoryError> {
        match task.state {
            TaskState::Pending | TaskState::Started => {
                warn!(state = %task.state, "Executor lost the job");
                self.transition(task, TaskState::Unknown, TaskUpdate::none()).await
            }
            _ => Ok(Some(EventOutcome::Stale)),
        }
    }

    async fn on_failure(
        &self,
        task: &Task,
        error: TaskError,
    ) -> Result<Option<EventOutcome>, RepositoryError> {
        if !task.state.is_in_flight() {
            return Ok(Some(EventOutcome::Stale));
        }
        let Some(run) = self.ctx.repository.get_run(task.run_id).await? else {
            return Ok(Some(EventOutcome::Stale));
        };
        Ok(fail_or_retry(&self.ctx, &run.dag, task, error)
            .await?
            .map(EventOutcome::Transitioned))
    }

    /// Compare-and-set from the state just read; `None` means re-read and try again.
    async fn transition(
        &self,
        task: &Task,
        next: TaskState,
        update: TaskUpdate,
    ) -> Result<Option<EventOutcome>, RepositoryError> {
        let outcome = self
            .ctx
            .repository
            .compare_and_set_task_state(&task.key(), Expected::of(task), next, update)
            .await?;
        match outcome {
            CasOutcome::Applied(_) => {
                debug!(from = %task.state, to = %next, "Task transitioned");
                self.ctx.trigger.fire(task.run_id);
                Ok(Some(EventOutcome::Transitioned(next)))
            }
            CasOutcome::Conflict => Ok(None),
        }
    }
}

/// Record a failure of the task's current attempt.
///
/// A transient failure with retry budget left moves the task to `RETRY` and
/// starts the next attempt; a pass is requested once its backoff has elapsed.
/// Anything else is `FAILED`, and every non-terminal downstream task is aborted.
///
/// Returns the state written, `None` if the task moved in the meantime.
pub async fn fail_or_retry(
    ctx: &SchedulerContext,
    dag: &PipelineDag,
    task: &Task,
    error: TaskError,
) -> Result<Option<TaskState>, RepositoryError> {
    let node_retries = dag.node(&task.node_id).and_then(|n| n.spec.max_retries);
    let max_retries = ctx.policy.max_retries_for(node_retries);
    let retry = error.class.is_transient() && task.attempt_count < max_retries;

    let (next, update) = if retry {
        let update = TaskUpdate {
            next_attempt: true,
            error: Some(error.clone()),
            ..TaskUpdate::none()
        };
        (TaskState::Retry, update)
    } else {
        (TaskState::Failed, TaskUpdate::error(error.clone()))
    };

    let outcome = ctx
        .repository
        .compare_and_set_task_state(&task.key(), Expected::of(task), next, update)
        .await?;
    if !outcome.is_applied() {
        return Ok(None);
    }

    if retry {
        let delay = ctx.policy.backoff(task.attempt_count + 1);
        info!(
            run_id = %task.run_id,
            node = %task.node_id,
            attempt = task.attempt_count,
            class = ?error.class,
            backoff = ?delay,
            "Task failed, retrying"
        );
        ctx.trigger.fire_after(task.run_id, delay);
    } else {
        warn!(
            run_id = %task.run_id,
            node = %task.node_id,
            attempt = task.attempt_count,
            class = ?error.class,
            error = %error.message,
            "Task failed"
        );
        if let Some(snapshot) = ctx.repository.snapshot(task.run_id).await? {
            let aborted = abort_downstream(ctx, &snapshot).await?;
            if aborted > 0 {
                info!(run_id = %task.run_id, node = %task.node_id, aborted, "Aborted downstream tasks");
            }
        }
        ctx.trigger.fire(task.run_id);
    }
    Ok(Some(next))
}

// =============================================================================
// Completion Sources
// =============================================================================

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("event feed unavailable: {0}")]
    Client(#[from] ClientError),
}

/// Supplier of executor events
#[async_trait]
pub trait CompletionSource: Send {
    /// Wait for the next events. `Ok(None)` means the source is exhausted.
    async fn next_batch(&mut self) -> Result<Option<Vec<ExecutorEvent>>, SourceError>;
}

/// Polls the executor event feed with a cursor
pub struct PollingSource {
    client: ExecutorClient,
    cursor: u64,
    interval: tokio::time::Interval,
}

impl PollingSource {
    pub fn new(client: ExecutorClient, poll_interval: Duration) -> Self {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            client,
            cursor: 0,
            interval,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

#[async_trait]
impl CompletionSource for PollingSource {
    async fn next_batch(&mut self) -> Result<Option<Vec<ExecutorEvent>>, SourceError> {
        self.interval.tick().await;
        let batch = self.client.poll_events(self.cursor).await?;
        self.cursor = batch.cursor;
        Ok(Some(batch.events))
    }
}

/// Events pushed by any collaborator through a channel
pub struct ChannelSource {
    rx: mpsc::Receiver<ExecutorEvent>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<ExecutorEvent>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl CompletionSource for ChannelSource {
    async fn next_batch(&mut self) -> Result<Option<Vec<ExecutorEvent>>, SourceError> {
        let Some(first) = self.rx.recv().await else {
            return Ok(None);
        };
        let mut batch = vec![first];
        while batch.len() < CHANNEL_BATCH {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        Ok(Some(batch))
    }
}

/// Drives a [`CompletionSource`] through the [`Reconciler`]
pub struct ReconcilerWorker {
    reconciler: Reconciler,
    source: Box<dyn CompletionSource>,
}

impl ReconcilerWorker {
    pub fn new(reconciler: Reconciler, source: Box<dyn CompletionSource>) -> Self {
        Self { reconciler, source }
    }

    /// Apply events until the source is exhausted or shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting reconciler worker");

        loop {
            tokio::select! {
                batch = self.source.next_batch() => match batch {
                    Ok(Some(events)) => apply_all(&self.reconciler, &events).await,
                    Ok(None) => {
                        info!("Completion source closed, reconciler worker stopping");
                        break;
                    }
                    Err(e) => error!(error = %e, "Failed to fetch executor events"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler worker shutting down");
                        break;
                    }
                }
            }
        }
    }

}

async fn apply_all(reconciler: &Reconciler, events: &[ExecutorEvent]) {
    for event in events {
        if let Err(e) = reconciler.apply(event).await {
            error!(
                job_id = %event.job.job_id,
                node = %event.job.node_id,
                error = %e,
                "Failed to apply executor event"
            );
        }
    }
}
