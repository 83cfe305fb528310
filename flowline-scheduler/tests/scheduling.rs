//! End-to-end scheduling scenarios against the in-memory store and a
//! scripted executor.

mod common;

use std::time::Duration;

use common::{Harness, Reply, graph, node, test_policy};
use flowline_core::dag::DagError;
use flowline_core::domain::run::RunState;
use flowline_core::domain::task::{FailureClass, TaskState};
use flowline_core::dto::computation::StartComputation;
use flowline_core::dto::executor::{CapacityReason, EventKind, JobHandle};
use flowline_scheduler::config::SchedulerPolicy;
use flowline_scheduler::error::ComputationError;
use flowline_scheduler::reconciler::EventOutcome;
use flowline_scheduler::repository::RunRepository;
use flowline_scheduler::scheduler::schedule_run;
use flowline_scheduler::service;
use flowline_scheduler::sweep::sweep;

#[tokio::test]
async fn test_linear_pipeline_runs_in_dependency_order() {
    let h = Harness::new();
    let g = graph(vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])]);
    let run_id = h.start(&g).await;

    let report = h.pass(run_id).await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.run_state, Some(RunState::Pending));

    let run = h.run_to_completion(run_id).await;
    assert_eq!(run.state, RunState::Success);
    assert!(run.ended_at.is_some());
    assert_eq!(h.executor.accepted_nodes(), vec!["a", "b", "c"]);
    assert!(h.executor.violations().is_empty(), "{:?}", h.executor.violations());
}

#[tokio::test]
async fn test_inputs_resolve_to_upstream_outputs() {
    let h = Harness::new();
    let g = graph(vec![node("a", &[]), node("b", &["a"])]);
    let run_id = h.start(&g).await;

    h.run_to_completion(run_id).await;

    let b = h
        .executor
        .accepted()
        .into_iter()
        .find(|d| d.node_id == "b")
        .unwrap();
    assert_eq!(b.inputs.len(), 1);
    assert_eq!(b.inputs[0].from_node, "a");
    assert_eq!(b.inputs[0].reference, "s3://bucket/a/out");
    assert_eq!(b.user_id, 7);
}

#[tokio::test]
async fn test_transient_failure_retries_until_success() {
    let h = Harness::new();
    let g = graph(vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])]);
    let run_id = h.start(&g).await;

    h.pass(run_id).await;
    let outcome = h.fail("a", FailureClass::Infrastructure).await;
    assert_eq!(outcome, EventOutcome::Transitioned(TaskState::Retry));
    assert_eq!(h.task(run_id, "a").await.attempt_count, 2);

    h.pass(run_id).await;
    h.fail("a", FailureClass::HeartbeatLost).await;

    h.pass(run_id).await;
    h.succeed("a").await;
    let run = h.run_to_completion(run_id).await;

    let a = h.task(run_id, "a").await;
    assert_eq!(a.state, TaskState::Success);
    assert_eq!(a.attempt_count, 3);
    assert_eq!(h.task(run_id, "b").await.state, TaskState::Success);
    assert_eq!(h.task(run_id, "c").await.state, TaskState::Success);
    assert_eq!(run.state, RunState::Success);

    let attempts: Vec<(String, u32)> = h
        .executor
        .accepted()
        .into_iter()
        .map(|d| (d.node_id, d.attempt))
        .collect();
    let expected = [("a", 1), ("a", 2), ("a", 3), ("b", 1), ("c", 1)]
        .map(|(n, a)| (n.to_string(), a))
        .to_vec();
    assert_eq!(attempts, expected);
    assert!(h.executor.violations().is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_fail_and_abort_downstream() {
    let h = Harness::new();
    let g = graph(vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])]);
    let run_id = h.start(&g).await;

    for _ in 0..3 {
        h.pass(run_id).await;
        h.fail("a", FailureClass::Infrastructure).await;
    }
    let report = h.pass(run_id).await;

    let a = h.task(run_id, "a").await;
    assert_eq!(a.state, TaskState::Failed);
    assert_eq!(a.attempt_count, 3);
    assert_eq!(a.error.unwrap().class, FailureClass::Infrastructure);
    assert_eq!(h.task(run_id, "b").await.state, TaskState::Aborted);
    assert_eq!(h.task(run_id, "c").await.state, TaskState::Aborted);
    assert_eq!(report.run_state, Some(RunState::Failed));
    assert_eq!(h.executor.accepted_nodes(), vec!["a", "a", "a"]);
}

#[tokio::test]
async fn test_node_retry_budget_overrides_default() {
    let h = Harness::new();
    let mut a = node("a", &[]);
    a.max_retries = Some(1);
    let run_id = h.start(&graph(vec![a])).await;

    h.pass(run_id).await;
    let outcome = h.fail("a", FailureClass::Infrastructure).await;

    assert_eq!(outcome, EventOutcome::Transitioned(TaskState::Failed));
    assert_eq!(h.task(run_id, "a").await.attempt_count, 1);
}

#[tokio::test]
async fn test_task_code_failure_is_not_retried() {
    let h = Harness::new();
    let g = graph(vec![node("a", &[]), node("b", &["a"]), node("x", &[])]);
    let run_id = h.start(&g).await;

    h.pass(run_id).await;
    let outcome = h.fail("a", FailureClass::TaskCode).await;
    assert_eq!(outcome, EventOutcome::Transitioned(TaskState::Failed));
    assert_eq!(h.task(run_id, "b").await.state, TaskState::Aborted);

    // Independent work still finishes
    h.succeed("x").await;
    let report = h.pass(run_id).await;

    assert_eq!(h.task(run_id, "a").await.attempt_count, 1);
    assert_eq!(h.task(run_id, "x").await.state, TaskState::Success);
    assert_eq!(report.run_state, Some(RunState::Failed));
    assert!(!h.executor.accepted_nodes().contains(&"b".to_string()));
}

#[tokio::test]
async fn test_rejected_submission_fails_task() {
    let h = Harness::new();
    h.executor.script("a", [Reply::Reject]);
    let g = graph(vec![node("a", &[]), node("b", &["a"])]);
    let run_id = h.start(&g).await;

    let report = h.pass(run_id).await;

    let a = h.task(run_id, "a").await;
    assert_eq!(report.failed, 1);
    assert_eq!(a.state, TaskState::Failed);
    assert_eq!(a.error.unwrap().class, FailureClass::Scheduling);
    assert_eq!(h.task(run_id, "b").await.state, TaskState::Aborted);
    assert_eq!(report.run_state, Some(RunState::Failed));
}

#[tokio::test]
async fn test_capacity_shortage_waits_without_spending_attempts() {
    let h = Harness::new();
    h.executor.script(
        "a",
        [
            Reply::NoCapacity(CapacityReason::ClusterNotReady),
            Reply::NoCapacity(CapacityReason::NoWorkers),
        ],
    );
    let run_id = h.start(&graph(vec![node("a", &[])])).await;

    let report = h.pass(run_id).await;
    assert_eq!(report.waiting, 1);
    assert_eq!(report.run_state, Some(RunState::WaitingForCluster));
    let a = h.task(run_id, "a").await;
    assert_eq!(a.state, TaskState::WaitingForCluster);
    assert!(a.cluster_wait_since.is_some());

    let report = h.pass(run_id).await;
    assert_eq!(report.run_state, Some(RunState::WaitingForResources));

    let report = h.pass(run_id).await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(h.task(run_id, "a").await.attempt_count, 1);
    assert_eq!(h.executor.accepted().len(), 1);
}

#[tokio::test]
async fn test_unreachable_executor_waits_for_cluster() {
    let h = Harness::new();
    h.executor.script("a", [Reply::Unreachable]);
    let run_id = h.start(&graph(vec![node("a", &[])])).await;

    h.pass(run_id).await;
    assert_eq!(h.task(run_id, "a").await.state, TaskState::WaitingForCluster);

    let run = h.run_to_completion(run_id).await;
    assert_eq!(run.state, RunState::Success);
}

#[tokio::test]
async fn test_cluster_wait_times_out() {
    let h = Harness::with_policy(SchedulerPolicy {
        cluster_wait_timeout: Duration::from_millis(10),
        ..test_policy()
    });
    h.executor
        .script("a", [Reply::NoCapacity(CapacityReason::ClusterNotReady)]);
    let run_id = h.start(&graph(vec![node("a", &[])])).await;
    h.pass(run_id).await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    let report = sweep(&h.ctx).await.unwrap();

    assert_eq!(report.cluster_timeouts, 1);
    let a = h.task(run_id, "a").await;
    assert_eq!(a.state, TaskState::Failed);
    assert_eq!(a.error.unwrap().class, FailureClass::ClusterUnavailable);
    assert_eq!(h.pass(run_id).await.run_state, Some(RunState::Failed));
}

#[tokio::test]
async fn test_lost_heartbeat_starts_new_attempt() {
    let h = Harness::with_policy(SchedulerPolicy {
        heartbeat_timeout: Duration::from_millis(10),
        ..test_policy()
    });
    let run_id = h.start(&graph(vec![node("a", &[])])).await;
    h.pass(run_id).await;
    h.heartbeat("a").await;
    let first = h.executor.job("a");

    tokio::time::sleep(Duration::from_millis(30)).await;
    let report = sweep(&h.ctx).await.unwrap();

    assert_eq!(report.heartbeat_lost, 1);
    let a = h.task(run_id, "a").await;
    assert_eq!(a.state, TaskState::Retry);
    assert_eq!(a.attempt_count, 2);
    assert_eq!(a.error.unwrap().class, FailureClass::HeartbeatLost);
    assert_eq!(h.executor.cancelled(), vec![first.clone()]);

    h.pass(run_id).await;
    assert_eq!(h.executor.job("a").attempt, 2);

    // The abandoned attempt reporting in late changes nothing
    let outcome = h.send(first, EventKind::Heartbeat).await;
    assert_eq!(outcome, EventOutcome::Stale);
    assert_eq!(h.task(run_id, "a").await.state, TaskState::Pending);
}

#[tokio::test]
async fn test_lost_job_is_retried_by_sweep() {
    let h = Harness::new();
    let run_id = h.start(&graph(vec![node("a", &[])])).await;
    h.pass(run_id).await;
    h.heartbeat("a").await;
    let first = h.executor.job("a");

    let outcome = h.send(first.clone(), EventKind::Lost).await;
    assert_eq!(outcome, EventOutcome::Transitioned(TaskState::Unknown));
    assert_eq!(h.task(run_id, "a").await.state, TaskState::Unknown);

    let report = sweep(&h.ctx).await.unwrap();
    assert_eq!(report.jobs_lost, 1);
    let a = h.task(run_id, "a").await;
    assert_eq!(a.state, TaskState::Retry);
    assert_eq!(a.attempt_count, 2);
    assert_eq!(a.error.unwrap().class, FailureClass::Infrastructure);
    assert_eq!(h.executor.cancelled(), vec![first]);

    let run = h.run_to_completion(run_id).await;
    assert_eq!(run.state, RunState::Success);
    assert_eq!(h.task(run_id, "a").await.attempt_count, 2);
}

#[tokio::test]
async fn test_heartbeat_revives_unknown_task() {
    let h = Harness::new();
    let run_id = h.start(&graph(vec![node("a", &[])])).await;
    h.pass(run_id).await;

    h.send(h.executor.job("a"), EventKind::Lost).await;
    let outcome = h.heartbeat("a").await;

    assert_eq!(outcome, EventOutcome::Transitioned(TaskState::Started));
    assert_eq!(h.task(run_id, "a").await.attempt_count, 1);
}

#[tokio::test]
async fn test_job_stuck_in_executor_queue_is_retried() {
    let h = Harness::with_policy(SchedulerPolicy {
        queue_timeout: Duration::from_millis(10),
        ..test_policy()
    });
    let run_id = h.start(&graph(vec![node("a", &[]), node("b", &["a"])])).await;
    h.pass(run_id).await;
    assert!(h.task(run_id, "a").await.job_id.is_some());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let report = sweep(&h.ctx).await.unwrap();

    assert_eq!(report.jobs_lost, 1);
    assert_eq!(report.heartbeat_lost, 0);
    let a = h.task(run_id, "a").await;
    assert_eq!(a.state, TaskState::Retry);
    assert_eq!(a.attempt_count, 2);

    h.pass(run_id).await;
    assert_eq!(h.executor.job("a").attempt, 2);
    h.succeed("a").await;
    let run = h.run_to_completion(run_id).await;
    assert_eq!(run.state, RunState::Success);
}

#[tokio::test]
async fn test_stale_events_are_ignored() {
    let h = Harness::new();
    let run_id = h.start(&graph(vec![node("a", &[])])).await;
    h.pass(run_id).await;
    h.fail("a", FailureClass::Infrastructure).await;
    let old = h.executor.job("a");
    h.pass(run_id).await;

    let outputs = [("out".to_string(), "s3://stale".to_string())].into();
    let outcome = h.send(old, EventKind::Succeeded { outputs }).await;
    assert_eq!(outcome, EventOutcome::Stale);

    let impostor = JobHandle {
        job_id: "someone-else".to_string(),
        ..h.executor.job("a")
    };
    let outcome = h.send(impostor, EventKind::Heartbeat).await;
    assert_eq!(outcome, EventOutcome::Stale);

    let a = h.task(run_id, "a").await;
    assert_eq!(a.state, TaskState::Pending);
    assert_eq!(a.attempt_count, 2);
    assert!(a.outputs.is_none());
}

#[tokio::test]
async fn test_progress_is_recorded() {
    let h = Harness::new();
    let run_id = h.start(&graph(vec![node("a", &[])])).await;
    h.pass(run_id).await;
    let job = h.executor.job("a");

    let outcome = h
        .send(job.clone(), EventKind::Progress { progress: 0.25 })
        .await;
    assert_eq!(outcome, EventOutcome::Transitioned(TaskState::Started));
    let outcome = h.send(job, EventKind::Progress { progress: 1.5 }).await;
    assert_eq!(outcome, EventOutcome::Recorded);

    let a = h.task(run_id, "a").await;
    assert_eq!(a.state, TaskState::Started);
    assert_eq!(a.progress, 1.0);
    assert!(a.last_heartbeat_at.is_some());
}

#[tokio::test]
async fn test_stop_aborts_everything_and_is_idempotent() {
    let h = Harness::new();
    let g = graph(vec![node("a", &[]), node("b", &[]), node("c", &["a"])]);
    let run_id = h.start(&g).await;
    h.pass(run_id).await;
    h.heartbeat("a").await;

    service::stop_computation(&h.ctx, g.project_id).await.unwrap();

    let run = h.run(run_id).await;
    assert_eq!(run.state, RunState::Aborted);
    assert!(run.cancel_requested);
    for id in ["a", "b", "c"] {
        assert_eq!(h.task(run_id, id).await.state, TaskState::Aborted, "{id}");
    }
    let mut cancelled: Vec<String> = h
        .executor
        .cancelled()
        .into_iter()
        .map(|j| j.node_id)
        .collect();
    cancelled.sort();
    assert_eq!(cancelled, vec!["a", "b"]);

    service::stop_computation(&h.ctx, g.project_id).await.unwrap();
    assert_eq!(h.executor.cancelled().len(), 2);

    // A late success does not resurrect the task
    let outputs = [("out".to_string(), "s3://late".to_string())].into();
    let outcome = h
        .send(h.executor.job("a"), EventKind::Succeeded { outputs })
        .await;
    assert_eq!(outcome, EventOutcome::Stale);
    assert_eq!(h.task(run_id, "a").await.state, TaskState::Aborted);

    let report = h.pass(run_id).await;
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.run_state, Some(RunState::Aborted));
}

#[tokio::test]
async fn test_stop_without_runs_is_an_error() {
    let h = Harness::new();
    let err = service::stop_computation(&h.ctx, uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, ComputationError::NoRun(_)));
}

#[tokio::test]
async fn test_rerun_reuses_identical_outputs() {
    let h = Harness::new();
    let g = graph(vec![node("a", &[]), node("b", &["a"])]);
    let first = h.start(&g).await;
    h.run_to_completion(first).await;
    let dispatched = h.executor.accepted().len();

    let second = h.start(&g).await;
    let report = h.pass(second).await;

    assert_eq!(report.reused, 2);
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.run_state, Some(RunState::Success));
    assert_eq!(h.executor.accepted().len(), dispatched);
    assert_eq!(h.run(second).await.iteration, 2);

    let b = h.task(second, "b").await;
    assert_eq!(b.outputs, h.task(first, "b").await.outputs);
}

#[tokio::test]
async fn test_changed_node_reruns_itself_and_downstream() {
    let h = Harness::new();
    let mut g = graph(vec![node("a", &[]), node("b", &["a"]), node("c", &[])]);
    let first = h.start(&g).await;
    h.run_to_completion(first).await;
    let before = h.executor.accepted().len();

    g.nodes[0].params = serde_json::json!({ "step": "a", "threshold": 3 });
    let second = h.start(&g).await;
    let run = h.run_to_completion(second).await;

    assert_eq!(run.state, RunState::Success);
    let rerun: Vec<String> = h.executor.accepted_nodes()[before..].to_vec();
    assert_eq!(rerun, vec!["a", "b"]);
}

#[tokio::test]
async fn test_force_rerun_skips_reuse() {
    let h = Harness::new();
    let g = graph(vec![node("a", &[])]);
    let first = h.start(&g).await;
    h.run_to_completion(first).await;

    let req = StartComputation {
        force_rerun: true,
        ..StartComputation::default()
    };
    let second = h.start_with(&g, req).await.unwrap();
    let report = h.pass(second).await;

    assert_eq!(report.reused, 0);
    assert_eq!(report.dispatched, 1);
}

#[tokio::test]
async fn test_node_subset_runs_only_ancestors() {
    let h = Harness::new();
    let g = graph(vec![
        node("a", &[]),
        node("b", &["a"]),
        node("c", &["b"]),
        node("d", &[]),
    ]);
    let req = StartComputation {
        node_subset: Some(vec!["b".to_string()]),
        ..StartComputation::default()
    };
    let run_id = h.start_with(&g, req).await.unwrap();

    let run = h.run_to_completion(run_id).await;

    assert_eq!(run.state, RunState::Success);
    assert_eq!(run.dag.len(), 2);
    assert_eq!(h.executor.accepted_nodes(), vec!["a", "b"]);
    assert_eq!(h.repository.list_tasks(run_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cyclic_pipeline_creates_no_run() {
    let h = Harness::new();
    let g = graph(vec![node("a", &["b"]), node("b", &["a"])]);

    let err = h
        .start_with(&g, StartComputation::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ComputationError::Validation(DagError::CycleDetected { .. })
    ));
    assert!(h.repository.latest_run(g.project_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_project_is_rejected() {
    let h = Harness::new();
    let req = StartComputation {
        project_id: uuid::Uuid::new_v4(),
        ..StartComputation::default()
    };
    let err = service::start_computation(&h.ctx, &h.graphs, req)
        .await
        .unwrap_err();
    assert!(matches!(err, ComputationError::ProjectNotFound(_)));
}

#[tokio::test]
async fn test_one_active_run_per_project() {
    let h = Harness::new();
    let g = graph(vec![node("a", &[])]);
    let run_id = h.start(&g).await;

    let err = h
        .start_with(&g, StartComputation::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ComputationError::AlreadyRunning(p) if p == g.project_id));

    h.run_to_completion(run_id).await;
    let next = h.start(&g).await;
    assert_ne!(next, run_id);
}

#[tokio::test]
async fn test_concurrent_passes_dispatch_each_task_once() {
    let h = Harness::new();
    h.executor.set_delay(Duration::from_millis(20));
    let g = graph(vec![
        node("a", &[]),
        node("b", &[]),
        node("c", &[]),
        node("d", &["a", "b"]),
    ]);
    let run_id = h.start(&g).await;

    let (r1, r2, r3) = tokio::join!(
        schedule_run(&h.ctx, run_id),
        schedule_run(&h.ctx, run_id),
        schedule_run(&h.ctx, run_id),
    );
    let dispatched = r1.unwrap().dispatched + r2.unwrap().dispatched + r3.unwrap().dispatched;

    assert_eq!(dispatched, 3);
    let mut nodes = h.executor.accepted_nodes();
    nodes.sort();
    assert_eq!(nodes, vec!["a", "b", "c"]);
    assert!(h.executor.violations().is_empty(), "{:?}", h.executor.violations());
}

#[tokio::test]
async fn test_status_lists_tasks_in_pipeline_order() {
    let h = Harness::new();
    let g = graph(vec![node("b", &["a"]), node("a", &[])]);
    let run_id = h.start(&g).await;
    h.pass(run_id).await;

    let status = service::get_computation_status(&h.ctx, g.project_id)
        .await
        .unwrap();

    assert_eq!(status.run.id, run_id);
    assert_eq!(status.run.state, RunState::Pending);
    let order: Vec<&str> = status.tasks.iter().map(|t| t.node_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b"]);
    assert_eq!(status.tasks[0].state, TaskState::Pending);
    assert_eq!(status.tasks[1].state, TaskState::Published);
}
