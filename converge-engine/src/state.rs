//! Run state aggregation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::Attributes;

/// Key reserved for the aggregate change flag in serialized state. Never a
/// resource name and never a reference target.
pub const CHANGED_KEY: &str = "changed";

/// Realized state carried across reconciliation runs.
///
/// Serializes to the flat mapping persisted between runs: one key per
/// resource plus the reserved `changed` flag, e.g.
/// `{"changed": true, "parent": {"id": "id1", "changed": true}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    /// Aggregate change flag: OR of per-resource changes in the latest run.
    #[serde(default)]
    pub changed: bool,
    /// Realized attributes per resource name.
    #[serde(flatten)]
    resources: Map<String, Value>,
}

impl RunState {
    /// State with no realized resources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the aggregate flag at the start of a run.
    pub fn reset_changed(&mut self) {
        self.changed = false;
    }

    /// True when `name` has realized attributes.
    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    /// Realized attributes of `name`, if any.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.resources.get(name)
    }

    /// The mapping references resolve against. The reserved `changed` key is
    /// not part of it.
    pub fn resources(&self) -> &Map<String, Value> {
        &self.resources
    }

    /// Merge one resource's operation result.
    ///
    /// A non-empty result is stored under `name` and its own `changed` flag
    /// folds into the aggregate. An empty result removes the entry; removing
    /// a name that was present counts as a change, removing an absent name is
    /// a no-op. Callers must not pass the reserved `changed` key as a name;
    /// the engine rejects such resources before running.
    pub fn record(&mut self, name: &str, attributes: Attributes) {
        if attributes.is_empty() {
            if self.resources.remove(name).is_some() {
                self.changed = true;
            }
            return;
        }
        self.changed |= attributes
            .get(CHANGED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.resources.insert(name.to_owned(), Value::Object(attributes));
    }
}
