//! One scheduler pass over a run

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use flowline_core::domain::run::RunState;
use flowline_core::domain::task::{FailureClass, Task, TaskError, TaskState};
use flowline_core::dto::executor::{CapacityReason, TaskDescriptor};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cancellation::{abort_downstream, abort_run_tasks, cancel_jobs};
use crate::config::SchedulerPolicy;
use crate::context::SchedulerContext;
use crate::dispatch::{DispatchError, SubmitOutcome, build_descriptor};
use crate::repository::{CasOutcome, Expected, RepositoryError, RunSnapshot, TaskUpdate};

/// What a pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub dispatched: usize,
    pub reused: usize,
    pub waiting: usize,
    pub failed: usize,
    pub aborted: usize,
    /// Run state after the pass, `None` if the run does not exist
    pub run_state: Option<RunState>,
}

enum Dispatched {
    Submitted,
    Waiting,
    Failed,
    /// Accepted by the executor after the task was aborted
    Orphaned,
    Skipped,
}

/// Tasks of the snapshot that may be claimed now.
///
/// A task is ready when it is dispatchable, every upstream task is `SUCCESS`
/// in this same snapshot, and, for a `RETRY`, its backoff has elapsed.
pub fn ready_tasks<'a>(
    snapshot: &'a RunSnapshot,
    policy: &SchedulerPolicy,
    now: DateTime<Utc>,
) -> Vec<&'a Task> {
    let states: HashMap<&str, TaskState> = snapshot
        .tasks
        .iter()
        .map(|t| (t.node_id.as_str(), t.state))
        .collect();
    let dag = &snapshot.run.dag;

    snapshot
        .tasks
        .iter()
        .filter(|task| task.state.is_dispatchable())
        .filter(|task| {
            dag.node(&task.node_id).is_some()
                && dag
                    .upstream_of(&task.node_id)
                    .iter()
                    .all(|up| states.get(up.as_str()) == Some(&TaskState::Success))
        })
        .filter(|task| retry_due(task, policy, now))
        .collect()
}

fn retry_due(task: &Task, policy: &SchedulerPolicy, now: DateTime<Utc>) -> bool {
    if task.state != TaskState::Retry {
        return true;
    }
    let Some(ended_at) = task.ended_at else {
        return true;
    };
    chrono::Duration::from_std(policy.backoff(task.attempt_count))
        .ok()
        .and_then(|delay| ended_at.checked_add_signed(delay))
        .is_some_and(|due| due <= now)
}

/// Run one scheduler pass over `run_id`.
///
/// Reuse can make downstream tasks ready, so the pass keeps going while it
/// reuses outputs. It ends by recomputing and persisting the run state.
#[instrument(skip(ctx))]
pub async fn schedule_run(
    ctx: &SchedulerContext,
    run_id: Uuid,
) -> Result<PassReport, RepositoryError> {
    let mut report = PassReport::default();

    loop {
        let Some(snapshot) = ctx.repository.snapshot(run_id).await? else {
            warn!("Run not found");
            return Ok(report);
        };
        if snapshot.run.state.is_terminal() {
            report.run_state = Some(snapshot.run.state);
            return Ok(report);
        }
        if snapshot.run.cancel_requested {
            report.aborted += abort_run_tasks(ctx, &snapshot).await?;
            break;
        }

        report.aborted += abort_downstream(ctx, &snapshot).await?;

        let ready = ready_tasks(&snapshot, &ctx.policy, Utc::now());
        if ready.is_empty() {
            break;
        }

        let mut reused_any = false;
        let mut claimed = Vec::new();
        for task in ready {
            let Some(node) = snapshot.run.dag.node(&task.node_id) else {
                continue;
            };

            if !node.force_rerun {
                let reusable = ctx
                    .repository
                    .find_reusable_outputs(&task.run_hash, run_id)
                    .await?;
                if let Some(outputs) = reusable {
                    let outcome = ctx
                        .repository
                        .compare_and_set_task_state(
                            &task.key(),
                            Expected::of(task),
                            TaskState::Success,
                            TaskUpdate::outputs(outputs),
                        )
                        .await?;
                    if outcome.is_applied() {
                        debug!(node = %task.node_id, "Reused outputs of an identical task");
                        report.reused += 1;
                        reused_any = true;
                    }
                    continue;
                }
            }

            let outcome = ctx
                .repository
                .compare_and_set_task_state(
                    &task.key(),
                    Expected::of(task),
                    TaskState::Pending,
                    TaskUpdate::none(),
                )
                .await?;
            if let CasOutcome::Applied(claimed_task) = outcome {
                let descriptor = build_descriptor(&snapshot.run, node, &claimed_task, &snapshot);
                claimed.push((claimed_task, descriptor));
            }
        }

        submit_all(ctx, claimed, &mut report).await;

        if !reused_any {
            break;
        }
    }

    report.run_state = settle_run_state(ctx, run_id).await?;
    if report.dispatched + report.reused + report.failed + report.aborted > 0 {
        info!(
            dispatched = report.dispatched,
            reused = report.reused,
            waiting = report.waiting,
            failed = report.failed,
            aborted = report.aborted,
            state = ?report.run_state,
            "Scheduler pass complete"
        );
    }
    Ok(report)
}

/// Submit claimed tasks concurrently and tally the outcomes.
async fn submit_all(
    ctx: &SchedulerContext,
    claimed: Vec<(Task, Result<TaskDescriptor, DispatchError>)>,
    report: &mut PassReport,
) {
    let mut set = JoinSet::new();
    for (task, descriptor) in claimed {
        let ctx = ctx.clone();
        set.spawn(async move {
            let node = task.node_id.clone();
            (node, submit_claimed(&ctx, task, descriptor).await)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(Dispatched::Submitted))) => report.dispatched += 1,
            Ok((_, Ok(Dispatched::Waiting))) => report.waiting += 1,
            Ok((_, Ok(Dispatched::Failed))) => report.failed += 1,
            Ok((_, Ok(Dispatched::Orphaned | Dispatched::Skipped))) => {}
            Ok((node, Err(e))) => error!(node = %node, error = %e, "Failed to record dispatch"),
            Err(e) => warn!("Dispatch task panicked: {}", e),
        }
    }
}

/// Submit one task already claimed as `PENDING` and record what happened.
async fn submit_claimed(
    ctx: &SchedulerContext,
    task: Task,
    descriptor: Result<TaskDescriptor, DispatchError>,
) -> Result<Dispatched, RepositoryError> {
    let submitted = match descriptor {
        Ok(descriptor) => ctx.dispatcher.submit(descriptor).await,
        Err(e) => Err(e),
    };
    let key = task.key();
    let claimed = Expected::of(&task);

    let (next, update) = match submitted {
        Ok(SubmitOutcome::Submitted(handle)) => {
            let recorded = ctx
                .repository
                .record_job_id(&key, task.attempt_count, &handle.job_id)
                .await?;
            if recorded.is_some_and(|t| t.state != TaskState::Aborted) {
                debug!(node = %task.node_id, attempt = task.attempt_count, job_id = %handle.job_id, "Task dispatched");
                return Ok(Dispatched::Submitted);
            }
            info!(node = %task.node_id, job_id = %handle.job_id, "Task aborted during submission, cancelling job");
            cancel_jobs(ctx, vec![handle]).await;
            return Ok(Dispatched::Orphaned);
        }
        Ok(SubmitOutcome::CapacityUnavailable(reason)) => {
            let next = match reason {
                CapacityReason::ClusterNotReady => TaskState::WaitingForCluster,
                CapacityReason::NoWorkers | CapacityReason::Timeout => {
                    TaskState::WaitingForResources
                }
            };
            debug!(node = %task.node_id, reason = ?reason, "No capacity for task");
            (next, TaskUpdate::none())
        }
        Err(DispatchError::Transport(message)) => {
            warn!(node = %task.node_id, error = %message, "Executor unreachable");
            (TaskState::WaitingForCluster, TaskUpdate::none())
        }
        Err(DispatchError::Rejected(message)) => {
            warn!(node = %task.node_id, error = %message, "Executor rejected task");
            let error = TaskError {
                class: FailureClass::Scheduling,
                message,
                logs_ref: None,
            };
            (TaskState::Failed, TaskUpdate::error(error))
        }
    };

    let outcome = ctx
        .repository
        .compare_and_set_task_state(&key, claimed, next, update)
        .await?;
    Ok(match (outcome, next) {
        (CasOutcome::Conflict, _) => Dispatched::Skipped,
        (CasOutcome::Applied(_), TaskState::Failed) => Dispatched::Failed,
        (CasOutcome::Applied(_), _) => Dispatched::Waiting,
    })
}

/// Cascade aborts, then derive the run state from its tasks and persist it.
///
/// Returns the run state, `None` if the run does not exist.
pub async fn settle_run_state(
    ctx: &SchedulerContext,
    run_id: Uuid,
) -> Result<Option<RunState>, RepositoryError> {
    let Some(mut snapshot) = ctx.repository.snapshot(run_id).await? else {
        return Ok(None);
    };
    if snapshot.run.state.is_terminal() {
        return Ok(Some(snapshot.run.state));
    }

    if abort_downstream(ctx, &snapshot).await? > 0 {
        match ctx.repository.snapshot(run_id).await? {
            Some(fresh) => snapshot = fresh,
            None => return Ok(None),
        }
    }

    let state = RunState::from_tasks(snapshot.tasks.iter().map(|t| t.state));
    if state != snapshot.run.state && ctx.repository.set_run_state(run_id, state).await? {
        info!(run_id = %run_id, from = %snapshot.run.state, to = %state, "Run state changed");
    }
    Ok(Some(state))
}
