//! Resource type schemas and their read-through cache.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, bail};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Control-plane description of a resource type.
///
/// Property references are pointer-like paths such as `/properties/VpcId`;
/// only the last segment names the property in the flat properties map.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSchema {
    pub type_name: String,
    pub primary_identifier: Vec<String>,
    #[serde(default)]
    pub read_only_properties: Vec<String>,
}

impl ResourceSchema {
    /// Name of the property that uniquely identifies an instance of this type.
    pub fn identifier_property(&self) -> anyhow::Result<&str> {
        let pointer = self
            .primary_identifier
            .first()
            .with_context(|| format!("schema for {} has no primary identifier", self.type_name))?;
        Ok(last_segment(pointer))
    }

    /// Properties the control plane computes itself; never patched.
    pub fn read_only(&self) -> Vec<&str> {
        self.read_only_properties
            .iter()
            .map(|pointer| last_segment(pointer))
            .collect()
    }
}

fn last_segment(pointer: &str) -> &str {
    match pointer.rfind('/') {
        Some(idx) => &pointer[idx + 1..],
        None => pointer,
    }
}

/// Caches schemas so each resource type is fetched at most once per process.
pub struct SchemaCache {
    http: reqwest::Client,
    base_url: String,
    cache: Mutex<HashMap<String, Arc<ResourceSchema>>>,
}

impl SchemaCache {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self {
            http,
            base_url,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Look up the schema for `type_name`, fetching it from the control plane
    /// on the first request.
    pub async fn get(&self, type_name: &str) -> anyhow::Result<Arc<ResourceSchema>> {
        let mut cache = self.cache.lock().await;
        if let Some(schema) = cache.get(type_name) {
            return Ok(Arc::clone(schema));
        }

        let url = format!("{}/schemas/{}", self.base_url, type_name);
        debug!(resource_type = type_name, "fetching resource schema");
        let response = self
            .http
            .get(&url)
            .header("x-request-id", Uuid::new_v4().to_string())
            .send()
            .await
            .with_context(|| format!("requesting schema for {type_name}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            bail!("unknown resource type {type_name}");
        }
        let schema: ResourceSchema = response
            .error_for_status()
            .with_context(|| format!("fetching schema for {type_name}"))?
            .json()
            .await
            .with_context(|| format!("decoding schema for {type_name}"))?;

        let schema = Arc::new(schema);
        cache.insert(type_name.to_owned(), Arc::clone(&schema));
        Ok(schema)
    }
}
