//! Declarative resource reconciliation: desired state in, realized state out.
//!
//! A run takes a mapping of resource name to definition, the previously
//! realized state, and an intent (present or absent). `resource:<name>.<path>`
//! tokens inside definitions order the work and are substituted with realized
//! attributes as dependencies complete; unrelated resources execute
//! concurrently against a [`ResourceClient`] backend, and results fold into a
//! [`RunState`] carrying one aggregate `changed` flag.

pub mod client;
pub mod error;
pub mod executor;
pub mod graph;
pub mod refs;
pub mod state;

pub use client::{Attributes, ResourceClient};
pub use error::EngineError;
pub use executor::{Engine, EngineConfig, default_workers};
pub use graph::{DependencyGraph, Intent};
pub use refs::{RefError, referenced_names, resolve_refs};
pub use state::{CHANGED_KEY, RunState};
