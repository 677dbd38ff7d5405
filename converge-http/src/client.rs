//! REST control-plane backend for the reconciliation engine.

use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use converge_engine::{Attributes, ResourceClient};
use reqwest::{Response, StatusCode, header};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::patch::diff_properties;
use crate::schema::SchemaCache;

/// Connection settings for a control plane.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,
    /// Preview changes without mutating the control plane.
    pub check_mode: bool,
    /// Delay between polls of an asynchronous operation.
    pub poll_interval: Duration,
    /// Polls before an asynchronous operation is given up on.
    pub poll_attempts: u32,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            check_mode: false,
            poll_interval: Duration::from_secs(10),
            poll_attempts: 30,
        }
    }
}

/// Reconciles resources against a REST control plane.
///
/// A resource body carries a `Type` naming the schema and a `Properties`
/// object; the property named by the schema's primary identifier addresses
/// the instance. Mutations answered with `202 Accepted` are polled to
/// completion through the `Location` header.
pub struct RestClient {
    http: reqwest::Client,
    config: RestConfig,
    schemas: SchemaCache,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Self {
        let http = reqwest::Client::new();
        let schemas = SchemaCache::new(http.clone(), config.base_url.clone());
        Self {
            http,
            config,
            schemas,
        }
    }

    fn resource_url(&self, type_name: &str, id: &str) -> String {
        format!("{}/resources/{}/{}", self.config.base_url, type_name, id)
    }

    /// Every control-plane request carries a fresh request id for tracing.
    async fn send(&self, request: reqwest::RequestBuilder) -> anyhow::Result<Response> {
        request
            .header("x-request-id", Uuid::new_v4().to_string())
            .send()
            .await
            .context("control plane request failed")
    }

    /// Current properties of the resource, or `None` if it does not exist.
    async fn fetch(&self, type_name: &str, id: &str) -> anyhow::Result<Option<Map<String, Value>>> {
        let url = self.resource_url(type_name, id);
        let response = self.send(self.http.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let properties = response
            .error_for_status()
            .with_context(|| format!("fetching {type_name}/{id}"))?
            .json::<Map<String, Value>>()
            .await
            .with_context(|| format!("decoding {type_name}/{id}"))?;
        Ok(Some(properties))
    }

    /// Settle a mutating request: synchronous success passes through, a
    /// `202 Accepted` is polled via its `Location` header, anything else is
    /// an error carrying the response body.
    async fn complete(&self, response: Response, action: &str) -> anyhow::Result<()> {
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::ACCEPTED => self.poll_operation(response, action).await,
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("{action} returned {status}: {body}")
            }
        }
    }

    async fn poll_operation(&self, response: Response, action: &str) -> anyhow::Result<()> {
        let location = response
            .headers()
            .get(header::LOCATION)
            .with_context(|| format!("{action} was accepted without a Location header"))?
            .to_str()
            .context("operation Location header is not valid UTF-8")?;
        let url = if location.starts_with('/') {
            format!("{}{}", self.config.base_url, location)
        } else {
            location.to_owned()
        };

        for attempt in 1..=self.config.poll_attempts {
            tokio::time::sleep(self.config.poll_interval).await;
            let poll = self.send(self.http.get(&url)).await?;
            if poll.status() == StatusCode::ACCEPTED {
                debug!(location = %url, attempt, "operation still in progress");
                continue;
            }
            poll.error_for_status()
                .with_context(|| format!("{action} failed asynchronously"))?;
            return Ok(());
        }
        bail!(
            "{action} did not finish after {} polls",
            self.config.poll_attempts
        )
    }

    async fn create(
        &self,
        type_name: &str,
        id: &str,
        desired: Map<String, Value>,
    ) -> anyhow::Result<Attributes> {
        if self.config.check_mode {
            debug!(resource_type = type_name, id, "would create resource");
            return Ok(result(true, type_name, desired, "Created"));
        }

        let url = self.resource_url(type_name, id);
        let response = self.send(self.http.put(&url).json(&desired)).await?;
        self.complete(response, &format!("creating {type_name}/{id}"))
            .await?;

        let realized = self
            .fetch(type_name, id)
            .await?
            .with_context(|| format!("{type_name}/{id} is missing after create"))?;
        info!(resource_type = type_name, id, "created resource");
        Ok(result(true, type_name, realized, "Created"))
    }

    async fn update(
        &self,
        type_name: &str,
        id: &str,
        desired: &Map<String, Value>,
        existing: Map<String, Value>,
        read_only: &[&str],
    ) -> anyhow::Result<Attributes> {
        let patch = diff_properties(&existing, desired, read_only);
        if patch.is_empty() {
            debug!(resource_type = type_name, id, "resource already converged");
            return Ok(result(false, type_name, existing, "Skipped"));
        }
        if self.config.check_mode {
            debug!(
                resource_type = type_name,
                id,
                ops = patch.len(),
                "would update resource"
            );
            return Ok(result(true, type_name, existing, "Updated"));
        }

        let url = self.resource_url(type_name, id);
        let response = self.send(self.http.patch(&url).json(&patch)).await?;
        self.complete(response, &format!("updating {type_name}/{id}"))
            .await?;

        let realized = self
            .fetch(type_name, id)
            .await?
            .with_context(|| format!("{type_name}/{id} is missing after update"))?;
        info!(
            resource_type = type_name,
            id,
            ops = patch.len(),
            "updated resource"
        );
        Ok(result(true, type_name, realized, "Updated"))
    }

    async fn delete(
        &self,
        type_name: &str,
        id: &str,
        existing: Map<String, Value>,
    ) -> anyhow::Result<Attributes> {
        if self.config.check_mode {
            debug!(resource_type = type_name, id, "would delete resource");
            return Ok(result(true, type_name, existing, "Deleted"));
        }

        let url = self.resource_url(type_name, id);
        let response = self.send(self.http.delete(&url)).await?;
        self.complete(response, &format!("deleting {type_name}/{id}"))
            .await?;
        info!(resource_type = type_name, id, "deleted resource");
        Ok(Attributes::new())
    }
}

#[async_trait]
impl ResourceClient for RestClient {
    async fn present(&self, resource: Value) -> anyhow::Result<Attributes> {
        let (type_name, properties) = parse_resource(&resource)?;
        let schema = self.schemas.get(&type_name).await?;
        let id = identifier(&properties, schema.identifier_property()?, &type_name)?.to_owned();

        match self.fetch(&type_name, &id).await? {
            None => self.create(&type_name, &id, properties).await,
            Some(existing) => {
                self.update(&type_name, &id, &properties, existing, &schema.read_only())
                    .await
            }
        }
    }

    async fn absent(&self, resource: Value) -> anyhow::Result<Attributes> {
        let (type_name, properties) = parse_resource(&resource)?;
        let schema = self.schemas.get(&type_name).await?;
        let id = identifier(&properties, schema.identifier_property()?, &type_name)?.to_owned();

        match self.fetch(&type_name, &id).await? {
            None => {
                debug!(resource_type = type_name, id, "resource already absent");
                Ok(result(false, &type_name, Map::new(), "Skipped"))
            }
            Some(existing) => self.delete(&type_name, &id, existing).await,
        }
    }
}

fn parse_resource(resource: &Value) -> anyhow::Result<(String, Map<String, Value>)> {
    let type_name = resource
        .get("Type")
        .and_then(Value::as_str)
        .context("resource has no Type")?
        .to_owned();
    let properties = resource
        .get("Properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    Ok((type_name, properties))
}

fn identifier<'a>(
    properties: &'a Map<String, Value>,
    id_property: &str,
    type_name: &str,
) -> anyhow::Result<&'a str> {
    properties
        .get(id_property)
        .and_then(Value::as_str)
        .with_context(|| format!("resource of type {type_name} has no {id_property} property"))
}

fn result(changed: bool, type_name: &str, properties: Map<String, Value>, msg: &str) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert("changed".to_owned(), Value::Bool(changed));
    attributes.insert("Type".to_owned(), Value::String(type_name.to_owned()));
    attributes.insert("Properties".to_owned(), Value::Object(properties));
    attributes.insert("msg".to_owned(), Value::String(msg.to_owned()));
    attributes
}
