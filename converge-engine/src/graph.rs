//! Dependency graph construction and pull-based scheduling.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::refs::referenced_names;

/// Reconciliation intent for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Create or update every resource in the desired set.
    Present,
    /// Delete every resource in the desired set.
    Absent,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Present => "present",
            Intent::Absent => "absent",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution-order constraints between resources, consumed as a pull-based
/// topological sort.
///
/// Nodes are the desired resource names. Under `present` a reference adds the
/// edge "referenced resource before referencing resource"; under `absent` the
/// edge inverts, so dependents are torn down before the resource they point
/// at. `take_ready` and `mark_done` drive the sort: a node surfaces in the
/// ready queue once its remaining predecessors reach zero, and is never
/// revisited.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Completing a node unblocks these.
    successors: HashMap<String, Vec<String>>,
    /// Remaining predecessor counts for nodes not yet done.
    predecessors: HashMap<String, usize>,
    /// Nodes with zero remaining predecessors, not yet handed out.
    ready: VecDeque<String>,
}

impl DependencyGraph {
    /// Build the graph for `desired` under `intent`.
    ///
    /// References to names outside the desired set contribute no edge; those
    /// are resolved from current state at execution time. Fails with
    /// [`EngineError::DependencyCycle`] before any backend operation when the
    /// references do not form a DAG. A self-reference is a cycle.
    pub fn build(desired: &Map<String, Value>, intent: Intent) -> Result<Self> {
        let mut successors: HashMap<String, Vec<String>> = HashMap::with_capacity(desired.len());
        let mut predecessors: HashMap<String, usize> = HashMap::with_capacity(desired.len());

        for name in desired.keys() {
            successors.entry(name.clone()).or_default();
            predecessors.entry(name.clone()).or_insert(0);
        }

        let mut edges = 0usize;
        for (name, body) in desired {
            for referenced in referenced_names(body) {
                if !desired.contains_key(&referenced) {
                    continue;
                }
                let (from, to) = match intent {
                    Intent::Present => (referenced, name.clone()),
                    Intent::Absent => (name.clone(), referenced),
                };
                successors.entry(from).or_default().push(to.clone());
                *predecessors.entry(to).or_insert(0) += 1;
                edges += 1;
            }
        }

        Self::check_acyclic(&successors, &predecessors)?;

        // Seed the ready queue in desired-map order so runs are deterministic.
        let ready: VecDeque<String> = desired
            .keys()
            .filter(|name| predecessors.get(*name) == Some(&0))
            .cloned()
            .collect();

        debug!(
            nodes = predecessors.len(),
            edges,
            intent = %intent,
            "built dependency graph"
        );

        Ok(Self {
            successors,
            predecessors,
            ready,
        })
    }

    /// Drain the nodes that are currently ready to execute. May be empty
    /// while work is still in flight.
    pub fn take_ready(&mut self) -> Vec<String> {
        self.ready.drain(..).collect()
    }

    /// Mark `name` finished and promote successors whose predecessors are all
    /// done. Marking a node twice has no effect.
    pub fn mark_done(&mut self, name: &str) {
        if self.predecessors.remove(name).is_none() {
            return;
        }
        if let Some(next) = self.successors.remove(name) {
            for succ in next {
                if let Some(count) = self.predecessors.get_mut(&succ) {
                    *count -= 1;
                    if *count == 0 {
                        self.ready.push_back(succ);
                    }
                }
            }
        }
    }

    /// True while any node has not been marked done.
    pub fn is_active(&self) -> bool {
        !self.predecessors.is_empty()
    }

    /// Kahn's algorithm over a scratch copy of the predecessor counts; any
    /// node left unvisited sits on or behind a cycle.
    fn check_acyclic(
        successors: &HashMap<String, Vec<String>>,
        predecessors: &HashMap<String, usize>,
    ) -> Result<()> {
        let mut counts = predecessors.clone();
        let mut queue: VecDeque<String> = counts
            .iter()
            .filter_map(|(name, count)| (*count == 0).then(|| name.clone()))
            .collect();

        let mut visited = 0usize;
        while let Some(name) = queue.pop_front() {
            visited += 1;
            if let Some(next) = successors.get(&name) {
                for succ in next {
                    if let Some(count) = counts.get_mut(succ) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(succ.clone());
                        }
                    }
                }
            }
        }

        if visited != predecessors.len() {
            let mut names: Vec<String> = counts
                .into_iter()
                .filter_map(|(name, count)| (count > 0).then_some(name))
                .collect();
            names.sort();
            return Err(EngineError::DependencyCycle { names });
        }
        Ok(())
    }
}
