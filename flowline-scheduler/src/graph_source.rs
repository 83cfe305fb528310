//! Supplier of live project graphs

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use flowline_core::domain::pipeline::ProjectGraph;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("project graph unavailable: {0}")]
pub struct GraphSourceError(pub String);

#[async_trait]
pub trait ProjectGraphSource: Send + Sync {
    /// Current graph of the project, `None` if the project does not exist
    async fn project_graph(&self, project_id: Uuid)
    -> Result<Option<ProjectGraph>, GraphSourceError>;
}

/// Graphs held in memory, registered up front
#[derive(Default)]
pub struct StaticGraphSource {
    graphs: RwLock<HashMap<Uuid, ProjectGraph>>,
}

impl StaticGraphSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the graph of `graph.project_id`
    pub fn insert(&self, graph: ProjectGraph) {
        let mut graphs = self
            .graphs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        graphs.insert(graph.project_id, graph);
    }
}

impl From<ProjectGraph> for StaticGraphSource {
    fn from(graph: ProjectGraph) -> Self {
        let source = Self::new();
        source.insert(graph);
        source
    }
}

#[async_trait]
impl ProjectGraphSource for StaticGraphSource {
    async fn project_graph(
        &self,
        project_id: Uuid,
    ) -> Result<Option<ProjectGraph>, GraphSourceError> {
        let graphs = self
            .graphs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(graphs.get(&project_id).cloned())
    }
}
