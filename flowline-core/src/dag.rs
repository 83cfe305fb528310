//! DAG Builder
//!
//! Turns a project graph snapshot into a validated, acyclic [`PipelineDag`].
//! Building is pure and deterministic: the same snapshot and selection always
//! produce the same nodes, in the same order, with the same `run_hash`es.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::pipeline::{NodeId, NodeSpec, ProjectGraph};
use crate::hash::run_hash;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("pipeline has no nodes")]
    EmptyPipeline,

    #[error("node '{0}' is defined more than once")]
    DuplicateNode(NodeId),

    #[error("node '{0}' references its own output")]
    SelfReference(NodeId),

    #[error("node '{node}' input '{input}' references unknown node '{from_node}'")]
    UnknownInput {
        node: NodeId,
        input: String,
        from_node: NodeId,
    },

    #[error("cycle detected in pipeline involving node '{node}'")]
    CycleDetected { node: NodeId },

    #[error("selected node '{0}' does not exist in the pipeline")]
    UnknownSelection(NodeId),
}

/// Which part of the pipeline to run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Nodes to run; their ancestors are always included. `None` runs everything.
    pub nodes: Option<Vec<NodeId>>,
    /// Disable output reuse for the selected nodes
    pub force_rerun: bool,
}

impl Selection {
    pub fn all() -> Self {
        Self::default()
    }
}

/// A node of a built pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    pub spec: NodeSpec,
    pub run_hash: String,
    /// Distinct upstream node ids, sorted
    pub upstream: Vec<NodeId>,
    /// When set, a prior successful output must not be reused
    pub force_rerun: bool,
}

impl DagNode {
    pub fn id(&self) -> &str {
        &self.spec.id
    }
}

/// Frozen, acyclic snapshot of a pipeline, nodes in topological order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDag {
    nodes: Vec<DagNode>,
}

impl PipelineDag {
    /// Validate `graph` and build the DAG for `selection`.
    pub fn build(graph: &ProjectGraph, selection: &Selection) -> Result<Self, DagError> {
        if graph.nodes.is_empty() {
            return Err(DagError::EmptyPipeline);
        }

        let mut specs: HashMap<&str, &NodeSpec> = HashMap::with_capacity(graph.nodes.len());
        for spec in &graph.nodes {
            if specs.insert(spec.id.as_str(), spec).is_some() {
                return Err(DagError::DuplicateNode(spec.id.clone()));
            }
        }

        let mut graph_map: DiGraphMap<&str, ()> = DiGraphMap::new();
        for spec in &graph.nodes {
            graph_map.add_node(spec.id.as_str());
        }
        for spec in &graph.nodes {
            for input in &spec.inputs {
                if input.from_node == spec.id {
                    return Err(DagError::SelfReference(spec.id.clone()));
                }
                if !specs.contains_key(input.from_node.as_str()) {
                    return Err(DagError::UnknownInput {
                        node: spec.id.clone(),
                        input: input.name.clone(),
                        from_node: input.from_node.clone(),
                    });
                }
                // Edge from producer to consumer
                graph_map.add_edge(input.from_node.as_str(), spec.id.as_str(), ());
            }
        }

        let order = toposort(&graph_map, None).map_err(|cycle| DagError::CycleDetected {
            node: cycle.node_id().to_string(),
        })?;

        let selected = match &selection.nodes {
            Some(ids) => {
                let mut selected = HashSet::with_capacity(ids.len());
                for id in ids {
                    if !specs.contains_key(id.as_str()) {
                        return Err(DagError::UnknownSelection(id.clone()));
                    }
                    selected.insert(id.as_str());
                }
                Some(selected)
            }
            None => None,
        };
        let included = match &selected {
            Some(selected) => with_ancestors(selected, &specs),
            None => specs.keys().copied().collect(),
        };

        let mut hashes: HashMap<&str, String> = HashMap::with_capacity(order.len());
        let mut nodes = Vec::with_capacity(included.len());
        for id in order {
            let spec = specs[id];
            let upstream: BTreeSet<&str> =
                spec.inputs.iter().map(|i| i.from_node.as_str()).collect();
            let hash = run_hash(
                spec,
                upstream.iter().map(|u| (*u, hashes[u].as_str())),
            );
            hashes.insert(id, hash.clone());

            if !included.contains(id) {
                continue;
            }
            let force_rerun = selection.force_rerun
                && selected.as_ref().is_none_or(|s| s.contains(id));
            nodes.push(DagNode {
                spec: spec.clone(),
                run_hash: hash,
                upstream: upstream.iter().map(|u| u.to_string()).collect(),
                force_rerun,
            });
        }

        Ok(Self { nodes })
    }

    /// Nodes in topological order
    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&DagNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn upstream_of(&self, id: &str) -> &[NodeId] {
        self.node(id).map(|n| n.upstream.as_slice()).unwrap_or(&[])
    }

    /// Every node transitively reachable downstream of `id`, excluding `id`
    pub fn downstream_of(&self, id: &str) -> BTreeSet<NodeId> {
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for node in &self.nodes {
            for up in &node.upstream {
                dependents.entry(up.as_str()).or_default().push(node.id());
            }
        }

        let mut reached = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for dependent in dependents.get(current).into_iter().flatten() {
                if reached.insert(dependent.to_string()) {
                    stack.push(dependent);
                }
            }
        }
        reached
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn with_ancestors<'a>(
    selected: &HashSet<&'a str>,
    specs: &HashMap<&'a str, &'a NodeSpec>,
) -> HashSet<&'a str> {
    let mut included: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = selected.iter().copied().collect();
    while let Some(id) = stack.pop() {
        if !included.insert(id) {
            continue;
        }
        for input in &specs[id].inputs {
            stack.push(input.from_node.as_str());
        }
    }
    included
}
