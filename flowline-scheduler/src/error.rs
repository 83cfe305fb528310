//! Errors visible to callers of the computation interface
//!
//! Transient executor failures and compare-and-set conflicts are handled
//! internally and never show up here.

use flowline_core::dag::DagError;
use thiserror::Error;
use uuid::Uuid;

use crate::graph_source::GraphSourceError;
use crate::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum ComputationError {
    /// Malformed or cyclic pipeline, rejected before any run exists
    #[error("invalid pipeline: {0}")]
    Validation(#[from] DagError),

    #[error("project {0} not found")]
    ProjectNotFound(Uuid),

    #[error("project {0} already has a computation running")]
    AlreadyRunning(Uuid),

    #[error("project {0} has never been computed")]
    NoRun(Uuid),

    #[error(transparent)]
    GraphSource(#[from] GraphSourceError),

    #[error(transparent)]
    Repository(RepositoryError),
}

impl From<RepositoryError> for ComputationError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::AlreadyActive { project_id } => Self::AlreadyRunning(project_id),
            other => Self::Repository(other),
        }
    }
}
