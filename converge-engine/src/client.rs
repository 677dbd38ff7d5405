//! Backend capability surface.

use async_trait::async_trait;
use serde_json::{Map, Value};

/// Realized attributes returned by a backend operation.
pub type Attributes = Map<String, Value>;

/// A backend capable of realizing resources.
///
/// The engine resolves references before dispatch and hands every operation a
/// fully resolved body; what the body means is up to the implementation. The
/// engine holds the client behind `Arc<dyn ResourceClient>` and never learns
/// a concrete type.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create or update the resource described by `resource`.
    ///
    /// Returns the realized attributes, including a `changed` flag.
    async fn present(&self, resource: Value) -> anyhow::Result<Attributes>;

    /// Delete the resource described by `resource`.
    ///
    /// Returns the empty mapping on deletion, or a snapshot with
    /// `changed=false` when the backend already lacks the resource.
    async fn absent(&self, resource: Value) -> anyhow::Result<Attributes>;
}
