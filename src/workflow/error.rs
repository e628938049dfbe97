//! Workflow error types.

use std::path::PathBuf;

use thiserror::Error;

use super::documents::StepStatus;
use crate::core::GraphError;

/// Result type for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors that can occur during workflow operations.
///
/// Failed dependency or criteria checks are not errors; they are returned
/// as values (`DependencyCheck`, `StepCompletion::Rejected`).
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A referenced topic, phase, or step does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The workflow document could not be parsed.
    #[error("Corrupt workflow document {}: {source}", path.display())]
    CorruptDocument {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The static workflow definition is malformed.
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// The step is not in a state that allows the requested operation.
    #[error("Step '{step_id}' cannot be started from status '{status}'")]
    InvalidTransition { step_id: String, status: StepStatus },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Dependency graph error.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl WorkflowError {
    pub(crate) fn topic_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "Topic", id: id.into() }
    }

    pub(crate) fn phase_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "Phase", id: id.into() }
    }

    pub(crate) fn step_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "Step", id: id.into() }
    }

    /// Whether this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
