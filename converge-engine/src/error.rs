//! Engine error types.

use thiserror::Error;

use crate::refs::RefError;

/// Errors that can abort a reconciliation run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The reference graph is not acyclic. Raised before any backend call.
    #[error("dependency cycle involving resources {names:?}")]
    DependencyCycle { names: Vec<String> },

    /// A resource uses the name reserved for the aggregate change flag.
    #[error("resource name '{name}' is reserved")]
    ReservedName { name: String },

    /// A reference in a resource body could not be resolved.
    #[error("failed to resolve references for resource '{resource}'")]
    Resolve {
        resource: String,
        #[source]
        source: RefError,
    },

    /// The backend rejected or failed one resource's operation.
    #[error("backend operation failed for resource '{resource}'")]
    Backend {
        resource: String,
        #[source]
        source: anyhow::Error,
    },

    /// A worker task panicked or was cancelled.
    #[error("worker task failed")]
    Worker(#[from] tokio::task::JoinError),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
