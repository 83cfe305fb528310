//! Executor DTOs: job submission, job identity and completion events

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::pipeline::{ImageRef, NodeId, ResourceRequest};
use crate::domain::run::ClusterSelection;
use crate::domain::task::FailureClass;

/// Job submission sent to the executor for one task attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub run_id: Uuid,
    pub project_id: Uuid,
    pub user_id: i64,
    pub node_id: NodeId,
    pub attempt: u32,
    pub image: ImageRef,
    pub resources: ResourceRequest,
    pub inputs: Vec<ResolvedInput>,
    pub params: serde_json::Value,
    pub cluster: ClusterSelection,
    /// Only set for on-demand clusters
    pub worker_type: Option<String>,
}

/// A node input bound to the concrete output reference of its producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedInput {
    pub name: String,
    pub from_node: NodeId,
    pub output: String,
    pub reference: String,
}

/// Identity of a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub run_id: Uuid,
    pub node_id: NodeId,
    pub attempt: u32,
}

/// Why the executor could not take a job right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityReason {
    NoWorkers,
    ClusterNotReady,
    /// Submission did not complete within its deadline
    Timeout,
}

/// Signal reported by the executor about a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorEvent {
    pub job: JobHandle,
    #[serde(flatten)]
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Progress {
        progress: f64,
    },
    Heartbeat,
    Succeeded {
        outputs: BTreeMap<String, String>,
    },
    Failed {
        class: FailureClass,
        message: String,
        logs_ref: Option<String>,
    },
    HeartbeatLost,
    /// The executor no longer knows the job
    Lost,
}

/// One page of the executor event feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<ExecutorEvent>,
    /// Pass back on the next poll to continue after this page
    pub cursor: u64,
}
