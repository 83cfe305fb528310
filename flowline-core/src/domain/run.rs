//! Run domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dag::PipelineDag;
use crate::domain::task::TaskState;

/// One execution attempt of an entire pipeline DAG
///
/// The DAG snapshot is frozen when the run is created so that edits to the
/// live project do not affect a run in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub project_id: Uuid,
    pub user_id: i64,
    pub iteration: i32,
    pub state: RunState,
    pub cancel_requested: bool,
    pub cluster_selection: ClusterSelection,
    pub dag: PipelineDag,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Where a run's tasks are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterSelection {
    /// The shared, always-on executor cluster
    #[default]
    Static,
    /// Capacity provisioned for this run on demand
    OnDemand,
}

impl ClusterSelection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterSelection::Static => "static",
            ClusterSelection::OnDemand => "on_demand",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(ClusterSelection::Static),
            "on_demand" => Some(ClusterSelection::OnDemand),
            _ => None,
        }
    }
}

/// Overall state of a run, derived from its tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Published,
    Pending,
    WaitingForResources,
    WaitingForCluster,
    Started,
    Success,
    Failed,
    Aborted,
    Unknown,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Success | RunState::Failed | RunState::Aborted)
    }

    /// Derive the run state from the states of all its tasks.
    ///
    /// A run is terminal only once every task is terminal: `SUCCESS` if all
    /// succeeded, otherwise `FAILED` if any task failed, otherwise `ABORTED`.
    /// A task waiting in `RETRY` keeps the run in progress.
    pub fn from_tasks<I>(states: I) -> RunState
    where
        I: IntoIterator<Item = TaskState>,
    {
        let states: Vec<TaskState> = states.into_iter().collect();
        if states.is_empty() {
            return RunState::Unknown;
        }

        let any = |wanted: &[TaskState]| states.iter().any(|s| wanted.contains(s));

        if states.iter().all(|s| s.is_terminal()) {
            if states.iter().all(|s| *s == TaskState::Success) {
                return RunState::Success;
            }
            if any(&[TaskState::Failed]) {
                return RunState::Failed;
            }
            return RunState::Aborted;
        }

        let some_finished = states.iter().any(|s| s.is_terminal());
        if some_finished || any(&[TaskState::Started, TaskState::Retry, TaskState::Unknown]) {
            RunState::Started
        } else if any(&[TaskState::Pending]) {
            RunState::Pending
        } else if any(&[TaskState::WaitingForCluster]) {
            RunState::WaitingForCluster
        } else if any(&[TaskState::WaitingForResources]) {
            RunState::WaitingForResources
        } else {
            RunState::Published
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Published => "PUBLISHED",
            RunState::Pending => "PENDING",
            RunState::WaitingForResources => "WAITING_FOR_RESOURCES",
            RunState::WaitingForCluster => "WAITING_FOR_CLUSTER",
            RunState::Started => "STARTED",
            RunState::Success => "SUCCESS",
            RunState::Failed => "FAILED",
            RunState::Aborted => "ABORTED",
            RunState::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let state = match s {
            "PUBLISHED" => RunState::Published,
            "PENDING" => RunState::Pending,
            "WAITING_FOR_RESOURCES" => RunState::WaitingForResources,
            "WAITING_FOR_CLUSTER" => RunState::WaitingForCluster,
            "STARTED" => RunState::Started,
            "SUCCESS" => RunState::Success,
            "FAILED" => RunState::Failed,
            "ABORTED" => RunState::Aborted,
            "UNKNOWN" => RunState::Unknown,
            _ => return None,
        };
        Some(state)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
