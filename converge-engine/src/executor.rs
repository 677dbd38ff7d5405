//! Concurrent reconciliation driver.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::{Attributes, ResourceClient};
use crate::error::{EngineError, Result};
use crate::graph::{DependencyGraph, Intent};
use crate::refs::resolve_refs;
use crate::state::{CHANGED_KEY, RunState};

/// Tuning knobs for a reconciliation run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of backend operations in flight at once.
    pub workers: usize,
    /// Dry run: unresolved references pass through as literals and backends
    /// are expected to preview instead of mutate.
    pub check_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            check_mode: false,
        }
    }
}

/// Worker bound derived from the host: twice the available parallelism,
/// capped at 32.
pub fn default_workers() -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (parallelism * 2).min(32)
}

type TaskOutput = (String, anyhow::Result<Attributes>);

/// Drives a desired-state mapping to convergence through a [`ResourceClient`].
pub struct Engine {
    client: Arc<dyn ResourceClient>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(client: Arc<dyn ResourceClient>, config: EngineConfig) -> Self {
        Self { client, config }
    }

    /// Reconcile `desired` under `intent`, merging results into `state` as
    /// resources complete.
    ///
    /// The state is mutated in place so attributes realized before a failure
    /// survive it; the aggregate `changed` flag is reset when the run starts.
    /// Submission order follows the dependency graph; unrelated resources run
    /// concurrently up to the configured worker bound. The first resolution
    /// or backend error aborts the run after in-flight operations have been
    /// drained.
    pub async fn run(
        &self,
        desired: &Map<String, Value>,
        state: &mut RunState,
        intent: Intent,
    ) -> Result<()> {
        if desired.contains_key(CHANGED_KEY) {
            return Err(EngineError::ReservedName {
                name: CHANGED_KEY.to_owned(),
            });
        }

        state.reset_changed();
        let mut graph = DependencyGraph::build(desired, intent)?;

        info!(
            resources = desired.len(),
            intent = %intent,
            check_mode = self.config.check_mode,
            workers = self.config.workers,
            "starting reconciliation"
        );

        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();

        loop {
            // Submit everything currently ready. Absent skips mark nodes done
            // immediately, which can promote further nodes, so drain until the
            // frontier stays empty.
            loop {
                let ready = graph.take_ready();
                if ready.is_empty() {
                    break;
                }
                for name in ready {
                    if intent == Intent::Absent && !state.contains(&name) {
                        debug!(resource = %name, "not in state, nothing to delete");
                        graph.mark_done(&name);
                        continue;
                    }
                    let Some(body) = desired.get(&name) else {
                        graph.mark_done(&name);
                        continue;
                    };
                    let resolved =
                        match resolve_refs(body, state.resources(), self.config.check_mode) {
                            Ok(resolved) => resolved,
                            Err(err) => {
                                let failed = EngineError::Resolve {
                                    resource: name,
                                    source: err,
                                };
                                drain_in_flight(&mut tasks, state, &mut graph).await;
                                return Err(failed);
                            }
                        };
                    debug!(resource = %name, intent = %intent, "dispatching operation");
                    let client = Arc::clone(&self.client);
                    let permits = Arc::clone(&permits);
                    tasks.spawn(async move {
                        let result = async {
                            let _permit = permits
                                .acquire_owned()
                                .await
                                .context("acquiring worker permit")?;
                            match intent {
                                Intent::Present => client.present(resolved).await,
                                Intent::Absent => client.absent(resolved).await,
                            }
                        }
                        .await;
                        (name, result)
                    });
                }
            }

            // Nothing in flight and nothing ready: the graph is exhausted.
            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((name, Ok(attributes))) => {
                    debug!(resource = %name, "operation completed");
                    state.record(&name, attributes);
                    graph.mark_done(&name);
                }
                Ok((name, Err(err))) => {
                    let failed = EngineError::Backend {
                        resource: name,
                        source: err,
                    };
                    drain_in_flight(&mut tasks, state, &mut graph).await;
                    return Err(failed);
                }
                Err(err) => {
                    let failed = EngineError::Worker(err);
                    drain_in_flight(&mut tasks, state, &mut graph).await;
                    return Err(failed);
                }
            }
        }

        info!(changed = state.changed, "reconciliation finished");
        Ok(())
    }
}

/// Let in-flight operations finish after a failure. Successful completions
/// still merge into state; further failures are logged and dropped, the
/// first error wins.
async fn drain_in_flight(
    tasks: &mut JoinSet<TaskOutput>,
    state: &mut RunState,
    graph: &mut DependencyGraph,
) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(attributes))) => {
                state.record(&name, attributes);
                graph.mark_done(&name);
            }
            Ok((name, Err(err))) => {
                warn!(resource = %name, error = %err, "operation failed while draining");
            }
            Err(err) => {
                warn!(error = %err, "worker task failed while draining");
            }
        }
    }
}
