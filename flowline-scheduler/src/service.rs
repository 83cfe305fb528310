//! Computation Service
//!
//! Inbound start/stop/status operations. Validation happens here, before any
//! run is created; everything after that is driven by the scheduler loop.

use flowline_core::dag::{PipelineDag, Selection};
use flowline_core::dto::computation::{ComputationStatus, StartComputation, TaskStatus};
use uuid::Uuid;

use crate::cancellation::cancel_run;
use crate::context::SchedulerContext;
use crate::error::ComputationError;
use crate::graph_source::ProjectGraphSource;
use crate::repository::NewRun;

/// Snapshot the project graph, validate it, create a run and trigger its first pass
pub async fn start_computation(
    ctx: &SchedulerContext,
    graphs: &dyn ProjectGraphSource,
    req: StartComputation,
) -> Result<Uuid, ComputationError> {
    let graph = graphs
        .project_graph(req.project_id)
        .await?
        .ok_or(ComputationError::ProjectNotFound(req.project_id))?;

    let selection = Selection {
        nodes: req.node_subset,
        force_rerun: req.force_rerun,
    };
    let dag = PipelineDag::build(&graph, &selection)?;

    if let Some(latest) = ctx.repository.latest_run(req.project_id).await? {
        if !latest.state.is_terminal() {
            return Err(ComputationError::AlreadyRunning(req.project_id));
        }
    }

    let run = ctx
        .repository
        .create_run(NewRun {
            project_id: req.project_id,
            user_id: req.user_id,
            cluster_selection: req.cluster_selection,
            dag,
        })
        .await?;

    tracing::info!(
        run_id = %run.id,
        project_id = %run.project_id,
        iteration = run.iteration,
        tasks = run.dag.len(),
        "Computation started"
    );
    ctx.trigger.fire(run.id);
    Ok(run.id)
}

/// Stop the latest run of the project. A no-op if it already finished.
pub async fn stop_computation(
    ctx: &SchedulerContext,
    project_id: Uuid,
) -> Result<(), ComputationError> {
    let run = ctx
        .repository
        .latest_run(project_id)
        .await?
        .ok_or(ComputationError::NoRun(project_id))?;

    let state = cancel_run(ctx, run.id).await?;
    tracing::info!(run_id = %run.id, state = ?state, "Computation stopped");
    Ok(())
}

/// Run and task states of the project's latest run, tasks in pipeline order
pub async fn get_computation_status(
    ctx: &SchedulerContext,
    project_id: Uuid,
) -> Result<ComputationStatus, ComputationError> {
    let run = ctx
        .repository
        .latest_run(project_id)
        .await?
        .ok_or(ComputationError::NoRun(project_id))?;
    let snapshot = ctx
        .repository
        .snapshot(run.id)
        .await?
        .ok_or(ComputationError::NoRun(project_id))?;

    let mut tasks = snapshot.tasks;
    let order = |node_id: &str| {
        snapshot
            .run
            .dag
            .nodes()
            .iter()
            .position(|n| n.id() == node_id)
    };
    tasks.sort_by_key(|t| order(&t.node_id));

    Ok(ComputationStatus {
        run: snapshot.run.into(),
        tasks: tasks.into_iter().map(TaskStatus::from).collect(),
    })
}
