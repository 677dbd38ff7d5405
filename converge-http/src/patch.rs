//! Property diffing into JSON Patch operations.

use serde::Serialize;
use serde_json::{Map, Value};

/// A single JSON Patch operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchOp {
    pub op: &'static str,
    pub path: String,
    pub value: Value,
}

/// Diff desired properties against the existing resource.
///
/// Keys missing from the existing resource become `add`, keys with a
/// different value become `replace`. Read-only properties are skipped, and
/// keys only the control plane knows about are left alone, so an empty result
/// means the resource is already converged.
pub fn diff_properties(
    existing: &Map<String, Value>,
    desired: &Map<String, Value>,
    read_only: &[&str],
) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    for (key, value) in desired {
        if read_only.contains(&key.as_str()) {
            continue;
        }
        match existing.get(key) {
            None => ops.push(PatchOp {
                op: "add",
                path: format!("/{key}"),
                value: value.clone(),
            }),
            Some(current) if current != value => ops.push(PatchOp {
                op: "replace",
                path: format!("/{key}"),
                value: value.clone(),
            }),
            Some(_) => {}
        }
    }
    ops
}
