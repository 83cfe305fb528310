//! Project graph domain types
//!
//! A project graph is the live, user-editable description of a pipeline. The
//! scheduler only ever works on a snapshot of it (see [`crate::dag`]).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a node in a project graph, reused as the task id within a run
pub type NodeId = String;

/// Snapshot of a project's computational graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectGraph {
    pub project_id: Uuid,
    pub nodes: Vec<NodeSpec>,
}

/// One computational step of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub image: ImageRef,
    #[serde(default)]
    pub resources: ResourceRequest,
    /// Ordered input references to other nodes' outputs
    #[serde(default)]
    pub inputs: Vec<InputRef>,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Worker type requested when the run uses on-demand capacity
    #[serde(default)]
    pub worker_type: Option<String>,
    /// Overrides the scheduler-wide retry budget for this node
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Container image a node runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Declared resource needs of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu: f64,
    pub ram_bytes: u64,
    #[serde(default)]
    pub gpu: Option<u32>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            ram_bytes: 1024 * 1024 * 1024,
            gpu: None,
        }
    }
}

/// Reference from a node input to an upstream node output
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputRef {
    /// Input port name on the consuming node
    pub name: String,
    pub from_node: NodeId,
    /// Output port name on the producing node
    pub output: String,
}
