//! Cancellation Handler
//!
//! Turns a stop request into `ABORTED` tasks: the run is flagged so no
//! scheduler pass dispatches anything more, every non-terminal task is moved
//! to `ABORTED`, and jobs already on the executor are cancelled best effort.
//! The same abort path is used to cascade a failure to its downstream tasks.

use std::collections::BTreeSet;

use flowline_core::domain::run::RunState;
use flowline_core::domain::task::{Task, TaskState};
use flowline_core::dto::executor::JobHandle;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::SchedulerContext;
use crate::repository::{CasOutcome, Expected, RepositoryError, RunSnapshot, TaskUpdate};
use crate::scheduler::settle_run_state;

/// Rounds of abort attempts before leaving stragglers to the scheduler pass
const CANCEL_ROUNDS: usize = 3;

/// Stop a run. Returns the run state afterwards, `None` if the run does not exist.
///
/// Repeated calls are no-ops once the run is terminal.
#[instrument(skip(ctx))]
pub async fn cancel_run(
    ctx: &SchedulerContext,
    run_id: Uuid,
) -> Result<Option<RunState>, RepositoryError> {
    let Some(run) = ctx.repository.get_run(run_id).await? else {
        return Ok(None);
    };
    if run.state.is_terminal() {
        debug!(state = %run.state, "Run already finished, nothing to cancel");
        return Ok(Some(run.state));
    }

    if ctx.repository.request_cancel(run_id).await? {
        info!("Cancellation requested");
    }

    for _ in 0..CANCEL_ROUNDS {
        let Some(snapshot) = ctx.repository.snapshot(run_id).await? else {
            return Ok(None);
        };
        if snapshot.tasks.iter().all(|t| t.state.is_terminal()) {
            break;
        }
        abort_run_tasks(ctx, &snapshot).await?;
    }

    let state = settle_run_state(ctx, run_id).await?;
    if !state.is_some_and(|s| s.is_terminal()) {
        // Tasks kept moving under us; the next pass finishes the job
        ctx.trigger.fire(run_id);
    }
    Ok(state)
}

/// Abort every non-terminal task of the run
pub async fn abort_run_tasks(
    ctx: &SchedulerContext,
    snapshot: &RunSnapshot,
) -> Result<usize, RepositoryError> {
    let live: Vec<&Task> = snapshot
        .tasks
        .iter()
        .filter(|t| !t.state.is_terminal())
        .collect();
    abort_tasks(ctx, live).await
}

/// Abort every non-terminal task downstream of a `FAILED` or `ABORTED` task
pub async fn abort_downstream(
    ctx: &SchedulerContext,
    snapshot: &RunSnapshot,
) -> Result<usize, RepositoryError> {
    let dag = &snapshot.run.dag;
    let doomed: BTreeSet<String> = snapshot
        .tasks
        .iter()
        .filter(|t| matches!(t.state, TaskState::Failed | TaskState::Aborted))
        .flat_map(|t| dag.downstream_of(&t.node_id))
        .collect();

    let targets: Vec<&Task> = snapshot
        .tasks
        .iter()
        .filter(|t| !t.state.is_terminal() && doomed.contains(&t.node_id))
        .collect();
    abort_tasks(ctx, targets).await
}

/// Move each task to `ABORTED`, then cancel the jobs of those that were in flight.
///
/// Tasks that moved since they were read are skipped. Returns how many were aborted.
async fn abort_tasks(
    ctx: &SchedulerContext,
    tasks: Vec<&Task>,
) -> Result<usize, RepositoryError> {
    let mut aborted = 0;
    let mut to_cancel = Vec::new();

    for task in tasks {
        let outcome = ctx
            .repository
            .compare_and_set_task_state(
                &task.key(),
                Expected::of(task),
                TaskState::Aborted,
                TaskUpdate::none(),
            )
            .await?;

        match outcome {
            CasOutcome::Applied(_) => {
                aborted += 1;
                debug!(node = %task.node_id, from = %task.state, "Task aborted");
                if let Some(job) = job_of(task) {
                    to_cancel.push(job);
                }
            }
            CasOutcome::Conflict => {
                debug!(node = %task.node_id, "Task moved before it could be aborted");
            }
        }
    }

    cancel_jobs(ctx, to_cancel).await;
    Ok(aborted)
}

/// Handle of the job a task has on the executor, if any
pub(crate) fn job_of(task: &Task) -> Option<JobHandle> {
    if !task.state.is_in_flight() {
        return None;
    }
    task.job_id.as_ref().map(|job_id| JobHandle {
        job_id: job_id.clone(),
        run_id: task.run_id,
        node_id: task.node_id.clone(),
        attempt: task.attempt_count,
    })
}

/// Cancel jobs concurrently. Failures are logged, never returned.
pub(crate) async fn cancel_jobs(ctx: &SchedulerContext, jobs: Vec<JobHandle>) {
    let mut set = JoinSet::new();
    for job in jobs {
        let dispatcher = ctx.dispatcher.clone();
        set.spawn(async move {
            let result = dispatcher.cancel(&job).await;
            (job, result)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((job, Ok(()))) => debug!(job_id = %job.job_id, node = %job.node_id, "Job cancelled"),
            Ok((job, Err(e))) => {
                warn!(job_id = %job.job_id, node = %job.node_id, error = %e, "Failed to cancel job")
            }
            Err(e) => warn!("Cancel task panicked: {}", e),
        }
    }
}
