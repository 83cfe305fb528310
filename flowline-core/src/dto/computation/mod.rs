//! Computation DTOs for the inbound start/stop/status interface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::pipeline::NodeId;
use crate::domain::run::{ClusterSelection, Run, RunState};
use crate::domain::task::{Task, TaskError, TaskState};

/// Request to start a computation of a project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartComputation {
    pub project_id: Uuid,
    pub user_id: i64,
    /// Run only these nodes and their ancestors
    #[serde(default)]
    pub node_subset: Option<Vec<NodeId>>,
    #[serde(default)]
    pub force_rerun: bool,
    #[serde(default)]
    pub cluster_selection: ClusterSelection,
}

/// Summary of a run without its DAG snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub project_id: Uuid,
    pub user_id: i64,
    pub iteration: i32,
    pub state: RunState,
    pub cancel_requested: bool,
    pub cluster_selection: ClusterSelection,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<Run> for RunSummary {
    fn from(run: Run) -> Self {
        Self {
            id: run.id,
            project_id: run.project_id,
            user_id: run.user_id,
            iteration: run.iteration,
            state: run.state,
            cancel_requested: run.cancel_requested,
            cluster_selection: run.cluster_selection,
            created_at: run.created_at,
            ended_at: run.ended_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub node_id: NodeId,
    pub state: TaskState,
    pub attempt_count: u32,
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<TaskError>,
}

impl From<Task> for TaskStatus {
    fn from(task: Task) -> Self {
        Self {
            node_id: task.node_id,
            state: task.state,
            attempt_count: task.attempt_count,
            progress: task.progress,
            started_at: task.started_at,
            ended_at: task.ended_at,
            error: task.error,
        }
    }
}

/// Run and task states of a project's latest computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationStatus {
    pub run: RunSummary,
    pub tasks: Vec<TaskStatus>,
}
