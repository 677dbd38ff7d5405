//! HTTP backend for the converge engine.
//!
//! Implements [`converge_engine::ResourceClient`] against a REST control
//! plane: resource types are described by schemas, instances are materialized
//! with PUT/PATCH/DELETE, and long-running operations are polled through
//! `Location` headers.

pub mod client;
pub mod patch;
pub mod schema;

pub use client::{RestClient, RestConfig};
pub use patch::{PatchOp, diff_properties};
pub use schema::{ResourceSchema, SchemaCache};
