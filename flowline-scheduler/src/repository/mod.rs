//! Run/Task Repository
//!
//! Durable store of runs and their tasks. Every task state change goes
//! through [`RunRepository::compare_and_set_task_state`]: the write only
//! happens when the task is still in the state and attempt the caller read.
//! Losing that race is not an error, it is reported as [`CasOutcome::Conflict`]
//! and the caller re-reads.

mod memory;
mod postgres;

pub use memory::InMemoryRunRepository;
pub use postgres::PgRunRepository;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_core::dag::PipelineDag;
use flowline_core::domain::run::{ClusterSelection, Run, RunState};
use flowline_core::domain::task::{IllegalTransition, Task, TaskError, TaskKey, TaskState};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("project {project_id} already has an active run")]
    AlreadyActive { project_id: Uuid },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Everything needed to create a run and its tasks
#[derive(Debug, Clone)]
pub struct NewRun {
    pub project_id: Uuid,
    pub user_id: i64,
    pub cluster_selection: ClusterSelection,
    pub dag: PipelineDag,
}

/// A run and all of its tasks, read at one point in time
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub run: Run,
    pub tasks: Vec<Task>,
}

impl RunSnapshot {
    pub fn task(&self, node_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.node_id == node_id)
    }
}

/// What the caller believes the task currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub state: TaskState,
    pub attempt: u32,
}

impl Expected {
    pub fn of(task: &Task) -> Self {
        Self {
            state: task.state,
            attempt: task.attempt_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Applied(Task),
    /// Someone else already moved the task
    Conflict,
}

impl CasOutcome {
    pub fn applied(&self) -> Option<&Task> {
        match self {
            CasOutcome::Applied(task) => Some(task),
            CasOutcome::Conflict => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

/// Field changes carried along with a state transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    /// Start a new attempt (entering `RETRY`)
    pub next_attempt: bool,
    pub progress: Option<f64>,
    pub outputs: Option<BTreeMap<String, String>>,
    pub error: Option<TaskError>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn outputs(outputs: BTreeMap<String, String>) -> Self {
        Self {
            outputs: Some(outputs),
            progress: Some(1.0),
            ..Self::default()
        }
    }

    pub fn error(error: TaskError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Create a run with the next iteration number and one `PUBLISHED` task per DAG node.
    ///
    /// Fails with [`RepositoryError::AlreadyActive`] when the project has an unfinished run.
    async fn create_run(&self, new_run: NewRun) -> Result<Run>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>>;

    /// Most recent run of a project, by iteration
    async fn latest_run(&self, project_id: Uuid) -> Result<Option<Run>>;

    /// Runs that are not in a terminal state
    async fn list_active_runs(&self) -> Result<Vec<Run>>;

    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<Task>>;

    async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>>;

    /// Read a run and all of its tasks in a single consistent read
    async fn snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>>;

    /// Move a task to `next` if it is still in `expected`.
    ///
    /// The transition is validated before anything is read. The write and the
    /// check happen atomically.
    async fn compare_and_set_task_state(
        &self,
        key: &TaskKey,
        expected: Expected,
        next: TaskState,
        update: TaskUpdate,
    ) -> Result<CasOutcome>;

    /// Record progress and liveness of the current attempt without changing state.
    ///
    /// Returns false when the task is terminal or on another attempt.
    async fn upsert_task_progress(
        &self,
        key: &TaskKey,
        attempt: u32,
        progress: Option<f64>,
        heartbeat_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Attach the executor job id to the current attempt, returning the task as written.
    async fn record_job_id(&self, key: &TaskKey, attempt: u32, job_id: &str)
    -> Result<Option<Task>>;

    /// Outputs of any successful task with this hash outside `exclude_run`
    async fn find_reusable_outputs(
        &self,
        run_hash: &str,
        exclude_run: Uuid,
    ) -> Result<Option<BTreeMap<String, String>>>;

    /// Flag the run for cancellation. Returns false if it was already flagged or is terminal.
    async fn request_cancel(&self, run_id: Uuid) -> Result<bool>;

    /// Persist the derived run state. A terminal run is never changed again.
    async fn set_run_state(&self, run_id: Uuid, state: RunState) -> Result<bool>;
}

/// Build the tasks of a freshly created run
fn initial_tasks(run: &Run, now: DateTime<Utc>) -> Vec<Task> {
    run.dag
        .nodes()
        .iter()
        .map(|node| Task {
            run_id: run.id,
            node_id: node.spec.id.clone(),
            state: TaskState::Published,
            attempt_count: 1,
            run_hash: node.run_hash.clone(),
            progress: 0.0,
            resources: node.spec.resources.clone(),
            job_id: None,
            outputs: None,
            error: None,
            started_at: None,
            ended_at: None,
            last_heartbeat_at: None,
            cluster_wait_since: None,
            modified_at: now,
        })
        .collect()
}

/// Clamp reported progress into `[0, 1]`. NaN and infinities are ignored.
fn sanitize_progress(progress: Option<f64>) -> Option<f64> {
    progress.filter(|p| p.is_finite()).map(|p| p.clamp(0.0, 1.0))
}

/// Apply a transition and its side effects to a task in place.
///
/// Claiming a task (`PENDING`) resets per-attempt fields. Entering `STARTED`
/// stamps the start and first heartbeat. `RETRY` and terminal states stamp the end.
fn apply_transition(task: &mut Task, next: TaskState, update: TaskUpdate, now: DateTime<Utc>) {
    task.state = next;
    task.modified_at = now;
    if update.next_attempt {
        task.attempt_count += 1;
    }

    match next {
        TaskState::Pending => {
            task.progress = 0.0;
            task.job_id = None;
            task.error = None;
            task.started_at = None;
            task.ended_at = None;
            task.last_heartbeat_at = None;
        }
        TaskState::WaitingForCluster => {
            task.cluster_wait_since.get_or_insert(now);
        }
        TaskState::Started => {
            task.started_at.get_or_insert(now);
            task.last_heartbeat_at.get_or_insert(now);
        }
        state if state == TaskState::Retry || state.is_terminal() => {
            task.ended_at = Some(now);
        }
        _ => {}
    }
    if !matches!(next, TaskState::Pending | TaskState::WaitingForCluster) {
        task.cluster_wait_since = None;
    }

    if let Some(progress) = sanitize_progress(update.progress) {
        task.progress = progress;
    }
    if let Some(outputs) = update.outputs {
        task.outputs = Some(outputs);
    }
    if let Some(error) = update.error {
        task.error = Some(error);
    }
    if let Some(at) = update.heartbeat_at {
        task.last_heartbeat_at = Some(at);
    }
}
