//! Task domain types and the task state machine

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::pipeline::{NodeId, ResourceRequest};

/// One DAG node's execution record within a specific run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub run_id: Uuid,
    pub node_id: NodeId,
    pub state: TaskState,
    /// 1-based; incremented each time the task enters `RETRY`
    pub attempt_count: u32,
    pub run_hash: String,
    /// In `[0, 1]`
    pub progress: f64,
    pub resources: ResourceRequest,
    pub job_id: Option<String>,
    /// Output port name to an opaque reference in the artifact store
    pub outputs: Option<BTreeMap<String, String>>,
    pub error: Option<TaskError>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Set when the task first waits for a cluster, kept across re-dispatch
    pub cluster_wait_since: Option<DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            run_id: self.run_id,
            node_id: self.node_id.clone(),
        }
    }
}

/// Identity of a task row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub run_id: Uuid,
    pub node_id: NodeId,
}

impl TaskKey {
    pub fn new(run_id: Uuid, node_id: impl Into<NodeId>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.run_id, self.node_id)
    }
}

/// Failure recorded on a task. Log content is never embedded, only referenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub class: FailureClass,
    pub message: String,
    pub logs_ref: Option<String>,
}

/// Classification of a task failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Worker crash, node loss, container runtime hiccup
    Infrastructure,
    HeartbeatLost,
    /// The step's own code failed
    TaskCode,
    /// The executor refused the job descriptor
    Scheduling,
    /// No cluster became available in time
    ClusterUnavailable,
    #[serde(other)]
    Unclassified,
}

impl FailureClass {
    /// Transient failures are retried automatically
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureClass::Infrastructure | FailureClass::HeartbeatLost)
    }
}

/// Task state
///
/// Transitions are validated by [`TaskState::check_transition`] and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    NotStarted,
    Published,
    Pending,
    WaitingForResources,
    WaitingForCluster,
    Started,
    Retry,
    Success,
    Failed,
    Aborted,
    Unknown,
}

/// Rejected attempt to move a task between two states
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal task transition from {from} to {to}")]
pub struct IllegalTransition {
    pub from: TaskState,
    pub to: TaskState,
}

impl TaskState {
    pub const ALL: [TaskState; 11] = [
        TaskState::NotStarted,
        TaskState::Published,
        TaskState::Pending,
        TaskState::WaitingForResources,
        TaskState::WaitingForCluster,
        TaskState::Started,
        TaskState::Retry,
        TaskState::Success,
        TaskState::Failed,
        TaskState::Aborted,
        TaskState::Unknown,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed | TaskState::Aborted)
    }

    /// States from which the scheduler may claim the task for dispatch
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self,
            TaskState::NotStarted
                | TaskState::Published
                | TaskState::Retry
                | TaskState::WaitingForResources
                | TaskState::WaitingForCluster
        )
    }

    /// States in which a job may exist on the executor
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskState::Pending | TaskState::Started | TaskState::Unknown
        )
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;

        if self.is_terminal() || *self == next {
            return false;
        }
        match next {
            Aborted => true,
            Published => *self == NotStarted,
            Pending => self.is_dispatchable(),
            WaitingForResources | WaitingForCluster => *self == Pending,
            Started => matches!(self, Pending | Unknown),
            // Dispatchable states reach SUCCESS only through output reuse
            Success => self.is_dispatchable() || self.is_in_flight(),
            Failed => self.is_in_flight() || *self == WaitingForCluster,
            Retry | Unknown => self.is_in_flight(),
            NotStarted => false,
        }
    }

    pub fn check_transition(&self, next: TaskState) -> Result<(), IllegalTransition> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(IllegalTransition {
                from: *self,
                to: next,
            })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::NotStarted => "NOT_STARTED",
            TaskState::Published => "PUBLISHED",
            TaskState::Pending => "PENDING",
            TaskState::WaitingForResources => "WAITING_FOR_RESOURCES",
            TaskState::WaitingForCluster => "WAITING_FOR_CLUSTER",
            TaskState::Started => "STARTED",
            TaskState::Retry => "RETRY",
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
            TaskState::Aborted => "ABORTED",
            TaskState::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown task state: {s}"))
    }
}
