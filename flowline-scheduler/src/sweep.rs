//! Periodic sweep
//!
//! Catches what no event will ever report: started tasks whose heartbeat went
//! stale, claims whose submission outcome was lost, jobs the executor lost or
//! never started, and tasks that waited too long for a cluster.

use chrono::{DateTime, Utc};
use flowline_core::domain::run::Run;
use flowline_core::domain::task::{FailureClass, Task, TaskError, TaskState};
use tracing::{info, instrument, warn};

use crate::cancellation::{cancel_jobs, job_of};
use crate::config::SchedulerPolicy;
use crate::context::SchedulerContext;
use crate::reconciler::fail_or_retry;
use crate::repository::{Expected, RepositoryError, TaskUpdate};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub runs: usize,
    pub heartbeat_lost: usize,
    pub jobs_lost: usize,
    pub cluster_timeouts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Healthy,
    HeartbeatLost,
    JobLost,
    ClusterTimeout,
}

fn judge(task: &Task, policy: &SchedulerPolicy, now: DateTime<Utc>) -> Verdict {
    let older_than = |at: DateTime<Utc>, limit: std::time::Duration| {
        chrono::Duration::from_std(limit)
            .ok()
            .and_then(|limit| at.checked_add_signed(limit))
            .is_some_and(|deadline| deadline < now)
    };

    match task.state {
        TaskState::Unknown => return Verdict::JobLost,
        TaskState::Started => {
            let last_seen = task
                .last_heartbeat_at
                .or(task.started_at)
                .unwrap_or(task.modified_at);
            if older_than(last_seen, policy.heartbeat_timeout) {
                return Verdict::HeartbeatLost;
            }
        }
        // Claimed but the submission outcome was never recorded
        TaskState::Pending if task.job_id.is_none() => {
            if older_than(task.modified_at, policy.heartbeat_timeout) {
                return Verdict::HeartbeatLost;
            }
        }
        // Accepted by the executor but never started
        TaskState::Pending => {
            if older_than(task.modified_at, policy.queue_timeout) {
                return Verdict::JobLost;
            }
        }
        TaskState::WaitingForCluster => {
            let since = task.cluster_wait_since.unwrap_or(task.modified_at);
            if older_than(since, policy.cluster_wait_timeout) {
                return Verdict::ClusterTimeout;
            }
        }
        _ => {}
    }
    Verdict::Healthy
}

/// Sweep every active run once.
#[instrument(skip(ctx))]
pub async fn sweep(ctx: &SchedulerContext) -> Result<SweepReport, RepositoryError> {
    let now = Utc::now();
    let mut report = SweepReport::default();

    for run in ctx.repository.list_active_runs().await? {
        report.runs += 1;
        for task in ctx.repository.list_tasks(run.id).await? {
            match judge(&task, &ctx.policy, now) {
                Verdict::Healthy => {}
                Verdict::HeartbeatLost => {
                    let error = TaskError {
                        class: FailureClass::HeartbeatLost,
                        message: format!(
                            "no heartbeat within {}s",
                            ctx.policy.heartbeat_timeout.as_secs()
                        ),
                        logs_ref: None,
                    };
                    if give_up_attempt(ctx, &run, &task, error).await? {
                        report.heartbeat_lost += 1;
                    }
                }
                Verdict::JobLost => {
                    let message = if task.state == TaskState::Unknown {
                        "executor lost the job".to_string()
                    } else {
                        format!(
                            "job did not start within {}s",
                            ctx.policy.queue_timeout.as_secs()
                        )
                    };
                    let error = TaskError {
                        class: FailureClass::Infrastructure,
                        message,
                        logs_ref: None,
                    };
                    if give_up_attempt(ctx, &run, &task, error).await? {
                        report.jobs_lost += 1;
                    }
                }
                Verdict::ClusterTimeout => {
                    if cluster_timeout(ctx, &task).await? {
                        report.cluster_timeouts += 1;
                    }
                }
            }
        }
    }

    if report.heartbeat_lost + report.jobs_lost + report.cluster_timeouts > 0 {
        info!(
            runs = report.runs,
            heartbeat_lost = report.heartbeat_lost,
            jobs_lost = report.jobs_lost,
            cluster_timeouts = report.cluster_timeouts,
            "Sweep complete"
        );
    }
    Ok(report)
}

/// Fail or retry the current attempt, then cancel whatever is left of its job.
async fn give_up_attempt(
    ctx: &SchedulerContext,
    run: &Run,
    task: &Task,
    error: TaskError,
) -> Result<bool, RepositoryError> {
    warn!(
        run_id = %run.id,
        node = %task.node_id,
        state = %task.state,
        reason = %error.message,
        "Task attempt lost"
    );
    if fail_or_retry(ctx, &run.dag, task, error).await?.is_none() {
        return Ok(false);
    }
    // The executor may still be running the abandoned attempt
    if let Some(job) = job_of(task) {
        cancel_jobs(ctx, vec![job]).await;
    }
    Ok(true)
}

async fn cluster_timeout(ctx: &SchedulerContext, task: &Task) -> Result<bool, RepositoryError> {
    warn!(run_id = %task.run_id, node = %task.node_id, "Timed out waiting for a cluster");
    let error = TaskError {
        class: FailureClass::ClusterUnavailable,
        message: format!(
            "no cluster became available within {}s",
            ctx.policy.cluster_wait_timeout.as_secs()
        ),
        logs_ref: None,
    };
    let outcome = ctx
        .repository
        .compare_and_set_task_state(
            &task.key(),
            Expected::of(task),
            TaskState::Failed,
            TaskUpdate::error(error),
        )
        .await?;
    if outcome.is_applied() {
        ctx.trigger.fire(task.run_id);
    }
    Ok(outcome.is_applied())
}
