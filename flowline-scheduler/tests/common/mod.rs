//! Test harness: an in-memory store, a scripted executor and helpers that
//! drive scheduler passes and executor events by hand.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flowline_core::domain::pipeline::{ImageRef, InputRef, NodeSpec, ProjectGraph};
use flowline_core::domain::run::Run;
use flowline_core::domain::task::{FailureClass, Task, TaskKey, TaskState};
use flowline_core::dto::computation::StartComputation;
use flowline_core::dto::executor::{
    CapacityReason, EventKind, ExecutorEvent, JobHandle, TaskDescriptor,
};
use flowline_scheduler::config::SchedulerPolicy;
use flowline_scheduler::context::{SchedulerContext, Trigger};
use flowline_scheduler::dispatch::{DispatchError, Dispatcher, SubmitOutcome};
use flowline_scheduler::error::ComputationError;
use flowline_scheduler::graph_source::StaticGraphSource;
use flowline_scheduler::reconciler::{EventOutcome, Reconciler};
use flowline_scheduler::repository::{InMemoryRunRepository, RunRepository};
use flowline_scheduler::scheduler::{PassReport, schedule_run};
use flowline_scheduler::service;
use uuid::Uuid;

/// Policy with instant retries so tests never wait on backoff
pub fn test_policy() -> SchedulerPolicy {
    SchedulerPolicy {
        retry_backoff_base: Duration::ZERO,
        ..SchedulerPolicy::default()
    }
}

pub fn node(id: &str, deps: &[&str]) -> NodeSpec {
    NodeSpec {
        id: id.to_string(),
        image: ImageRef {
            name: format!("registry/{id}"),
            tag: "1".to_string(),
        },
        resources: Default::default(),
        inputs: deps
            .iter()
            .map(|dep| InputRef {
                name: format!("in_{dep}"),
                from_node: dep.to_string(),
                output: "out".to_string(),
            })
            .collect(),
        params: serde_json::json!({ "step": id }),
        worker_type: None,
        max_retries: None,
    }
}

pub fn graph(nodes: Vec<NodeSpec>) -> ProjectGraph {
    ProjectGraph {
        project_id: Uuid::new_v4(),
        nodes,
    }
}

/// What the fake executor answers to the next submission of a node
#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    NoCapacity(CapacityReason),
    Reject,
    Unreachable,
}

#[derive(Default)]
struct ExecutorState {
    script: HashMap<String, VecDeque<Reply>>,
    accepted: Vec<TaskDescriptor>,
    seen: HashSet<(Uuid, String, u32)>,
    cancelled: Vec<JobHandle>,
    violations: Vec<String>,
    delay: Duration,
}

/// Scripted executor
///
/// Accepts everything unless told otherwise, and records an ordering
/// violation whenever a task is submitted before all of its upstream tasks
/// succeeded or the same attempt is accepted twice.
pub struct FakeExecutor {
    repository: Arc<InMemoryRunRepository>,
    state: Mutex<ExecutorState>,
}

impl FakeExecutor {
    pub fn new(repository: Arc<InMemoryRunRepository>) -> Self {
        Self {
            repository,
            state: Mutex::new(ExecutorState::default()),
        }
    }

    pub fn script(&self, node: &str, replies: impl IntoIterator<Item = Reply>) {
        let mut state = self.state.lock().unwrap();
        state
            .script
            .entry(node.to_string())
            .or_default()
            .extend(replies);
    }

    /// Slow every submission down, to widen race windows
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn accepted(&self) -> Vec<TaskDescriptor> {
        self.state.lock().unwrap().accepted.clone()
    }

    pub fn accepted_nodes(&self) -> Vec<String> {
        self.accepted().into_iter().map(|d| d.node_id).collect()
    }

    pub fn cancelled(&self) -> Vec<JobHandle> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().unwrap().violations.clone()
    }

    /// Handle of the latest accepted attempt of a node
    pub fn job(&self, node: &str) -> JobHandle {
        let state = self.state.lock().unwrap();
        let descriptor = state
            .accepted
            .iter()
            .rev()
            .find(|d| d.node_id == node)
            .unwrap_or_else(|| panic!("{node} was never dispatched"));
        handle_of(descriptor)
    }

    async fn check_ready(&self, descriptor: &TaskDescriptor) -> Vec<String> {
        let mut problems = Vec::new();
        let run = self
            .repository
            .get_run(descriptor.run_id)
            .await
            .unwrap()
            .expect("run exists");
        for upstream in run.dag.upstream_of(&descriptor.node_id) {
            let key = TaskKey::new(descriptor.run_id, upstream.clone());
            let task = self.repository.get_task(&key).await.unwrap();
            if task.map(|t| t.state) != Some(TaskState::Success) {
                problems.push(format!(
                    "{} submitted before {} succeeded",
                    descriptor.node_id, upstream
                ));
            }
        }
        problems
    }
}

fn handle_of(descriptor: &TaskDescriptor) -> JobHandle {
    JobHandle {
        job_id: format!("job-{}-{}", descriptor.node_id, descriptor.attempt),
        run_id: descriptor.run_id,
        node_id: descriptor.node_id.clone(),
        attempt: descriptor.attempt,
    }
}

#[async_trait]
impl Dispatcher for FakeExecutor {
    async fn submit(&self, descriptor: TaskDescriptor) -> Result<SubmitOutcome, DispatchError> {
        let problems = self.check_ready(&descriptor).await;

        let (reply, delay) = {
            let mut state = self.state.lock().unwrap();
            state.violations.extend(problems);
            let reply = state
                .script
                .get_mut(&descriptor.node_id)
                .and_then(|replies| replies.pop_front())
                .unwrap_or(Reply::Accept);
            (reply, state.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match reply {
            Reply::Accept => {
                let mut state = self.state.lock().unwrap();
                let key = (
                    descriptor.run_id,
                    descriptor.node_id.clone(),
                    descriptor.attempt,
                );
                if !state.seen.insert(key) {
                    state.violations.push(format!(
                        "{} attempt {} accepted twice",
                        descriptor.node_id, descriptor.attempt
                    ));
                }
                let handle = handle_of(&descriptor);
                state.accepted.push(descriptor);
                Ok(SubmitOutcome::Submitted(handle))
            }
            Reply::NoCapacity(reason) => Ok(SubmitOutcome::CapacityUnavailable(reason)),
            Reply::Reject => Err(DispatchError::Rejected("image not found".to_string())),
            Reply::Unreachable => Err(DispatchError::Transport("connection refused".to_string())),
        }
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), DispatchError> {
        self.state.lock().unwrap().cancelled.push(job.clone());
        Ok(())
    }
}

/// Everything a scenario needs, with passes driven by hand
pub struct Harness {
    pub repository: Arc<InMemoryRunRepository>,
    pub executor: Arc<FakeExecutor>,
    pub graphs: StaticGraphSource,
    pub ctx: SchedulerContext,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(test_policy())
    }

    pub fn with_policy(policy: SchedulerPolicy) -> Self {
        let repository = Arc::new(InMemoryRunRepository::new());
        let executor = Arc::new(FakeExecutor::new(repository.clone()));
        let ctx = SchedulerContext::new(
            repository.clone(),
            executor.clone(),
            policy,
            Trigger::disconnected(),
        );
        Self {
            repository,
            executor,
            graphs: StaticGraphSource::new(),
            reconciler: Reconciler::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn start(&self, graph: &ProjectGraph) -> Uuid {
        self.start_with(graph, StartComputation::default())
            .await
            .expect("computation starts")
    }

    pub async fn start_with(
        &self,
        graph: &ProjectGraph,
        req: StartComputation,
    ) -> Result<Uuid, ComputationError> {
        self.graphs.insert(graph.clone());
        let req = StartComputation {
            project_id: graph.project_id,
            user_id: 7,
            ..req
        };
        service::start_computation(&self.ctx, &self.graphs, req).await
    }

    pub async fn pass(&self, run_id: Uuid) -> PassReport {
        schedule_run(&self.ctx, run_id).await.expect("pass succeeds")
    }

    pub async fn run(&self, run_id: Uuid) -> Run {
        self.repository
            .get_run(run_id)
            .await
            .unwrap()
            .expect("run exists")
    }

    pub async fn task(&self, run_id: Uuid, node: &str) -> Task {
        self.repository
            .get_task(&TaskKey::new(run_id, node))
            .await
            .unwrap()
            .expect("task exists")
    }

    pub async fn send(&self, job: JobHandle, kind: EventKind) -> EventOutcome {
        let event = ExecutorEvent {
            job,
            kind,
            at: Utc::now(),
        };
        self.reconciler.apply(&event).await.expect("event applied")
    }

    pub async fn heartbeat(&self, node: &str) -> EventOutcome {
        self.send(self.executor.job(node), EventKind::Heartbeat).await
    }

    /// Start and succeed the latest attempt of a node
    pub async fn succeed(&self, node: &str) -> EventOutcome {
        self.heartbeat(node).await;
        let outputs = BTreeMap::from([("out".to_string(), format!("s3://bucket/{node}/out"))]);
        self.send(self.executor.job(node), EventKind::Succeeded { outputs })
            .await
    }

    /// Start and fail the latest attempt of a node
    pub async fn fail(&self, node: &str, class: FailureClass) -> EventOutcome {
        self.heartbeat(node).await;
        let kind = EventKind::Failed {
            class,
            message: format!("{node} crashed"),
            logs_ref: Some(format!("logs/{node}")),
        };
        self.send(self.executor.job(node), kind).await
    }

    /// Pass, then succeed every task that has a job on the executor, until
    /// the run settles
    pub async fn run_to_completion(&self, run_id: Uuid) -> Run {
        for _ in 0..32 {
            let report = self.pass(run_id).await;
            if report.run_state.is_some_and(|s| s.is_terminal()) {
                break;
            }
            let tasks = self.repository.list_tasks(run_id).await.unwrap();
            for task in tasks {
                if task.state.is_in_flight() && task.job_id.is_some() {
                    self.succeed(&task.node_id).await;
                }
            }
        }
        self.run(run_id).await
    }
}
