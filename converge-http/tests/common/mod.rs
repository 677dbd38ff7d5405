//! Shared test utilities for converge-http integration tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, put};
use axum::{Json, Router};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// In-memory control plane the client under test talks to.
#[derive(Default)]
pub struct ControlPlane {
    schemas: Mutex<HashMap<String, Value>>,
    schema_fetches: AtomicUsize,
    resources: Mutex<HashMap<String, Map<String, Value>>>,
    /// `(method, path)` of every request received, in order.
    requests: Mutex<Vec<(String, String)>>,
    /// When set, mutations answer 202 and the operation stays pending for
    /// this many polls.
    async_polls: Mutex<Option<usize>>,
    pending: Mutex<HashMap<String, usize>>,
    operation_seq: AtomicUsize,
}

impl ControlPlane {
    async fn log(&self, method: &str, path: String) {
        self.requests.lock().await.push((method.to_owned(), path));
    }

    async fn maybe_async(&self, sync_status: StatusCode) -> Response {
        let polls = *self.async_polls.lock().await;
        match polls {
            Some(polls) => {
                let op = format!("op-{}", self.operation_seq.fetch_add(1, Ordering::SeqCst));
                self.pending.lock().await.insert(op.clone(), polls);
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::LOCATION,
                    format!("/operations/{op}").parse().expect("valid header"),
                );
                (StatusCode::ACCEPTED, headers).into_response()
            }
            None => sync_status.into_response(),
        }
    }
}

async fn get_schema(
    State(cp): State<Arc<ControlPlane>>,
    Path(type_name): Path<String>,
) -> Response {
    cp.log("GET", format!("/schemas/{type_name}")).await;
    cp.schema_fetches.fetch_add(1, Ordering::SeqCst);
    match cp.schemas.lock().await.get(&type_name) {
        Some(schema) => (StatusCode::OK, Json(schema.clone())).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_resource(
    State(cp): State<Arc<ControlPlane>>,
    Path((type_name, id)): Path<(String, String)>,
) -> Response {
    cp.log("GET", format!("/resources/{type_name}/{id}")).await;
    match cp.resources.lock().await.get(&format!("{type_name}/{id}")) {
        Some(properties) => (StatusCode::OK, Json(Value::Object(properties.clone()))).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_resource(
    State(cp): State<Arc<ControlPlane>>,
    Path((type_name, id)): Path<(String, String)>,
    Json(properties): Json<Map<String, Value>>,
) -> Response {
    cp.log("PUT", format!("/resources/{type_name}/{id}")).await;
    cp.resources
        .lock()
        .await
        .insert(format!("{type_name}/{id}"), properties);
    cp.maybe_async(StatusCode::CREATED).await
}

async fn patch_resource(
    State(cp): State<Arc<ControlPlane>>,
    Path((type_name, id)): Path<(String, String)>,
    Json(ops): Json<Vec<Value>>,
) -> Response {
    cp.log("PATCH", format!("/resources/{type_name}/{id}")).await;
    let mut resources = cp.resources.lock().await;
    let Some(properties) = resources.get_mut(&format!("{type_name}/{id}")) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    for op in &ops {
        let path = op.get("path").and_then(Value::as_str).unwrap_or_default();
        if let Some(value) = op.get("value") {
            properties.insert(path.trim_start_matches('/').to_owned(), value.clone());
        }
    }
    drop(resources);
    cp.maybe_async(StatusCode::OK).await
}

async fn delete_resource(
    State(cp): State<Arc<ControlPlane>>,
    Path((type_name, id)): Path<(String, String)>,
) -> Response {
    cp.log("DELETE", format!("/resources/{type_name}/{id}")).await;
    if cp
        .resources
        .lock()
        .await
        .remove(&format!("{type_name}/{id}"))
        .is_none()
    {
        return StatusCode::NOT_FOUND.into_response();
    }
    cp.maybe_async(StatusCode::NO_CONTENT).await
}

async fn poll_operation(
    State(cp): State<Arc<ControlPlane>>,
    Path(op): Path<String>,
) -> StatusCode {
    cp.log("GET", format!("/operations/{op}")).await;
    let mut pending = cp.pending.lock().await;
    match pending.get_mut(&op) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            StatusCode::ACCEPTED
        }
        Some(_) => {
            pending.remove(&op);
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

/// Test server wrapper around an in-memory control plane.
pub struct TestServer {
    pub addr: SocketAddr,
    control_plane: Arc<ControlPlane>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestServer {
    /// Spawn the control plane on an OS-assigned port.
    pub async fn spawn() -> Self {
        let control_plane = Arc::new(ControlPlane::default());

        let router = Router::new()
            .route("/schemas/{type_name}", get(get_schema))
            .route("/resources/{type_name}/{id}", get(get_resource))
            .route("/resources/{type_name}/{id}", put(put_resource))
            .route("/resources/{type_name}/{id}", patch(patch_resource))
            .route("/resources/{type_name}/{id}", delete(delete_resource))
            .route("/operations/{op}", get(poll_operation))
            .with_state(control_plane.clone());

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
        let actual_addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        // Small delay to ensure server is ready
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        Self {
            addr: actual_addr,
            control_plane,
            shutdown_tx,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Register a schema under its type name.
    pub async fn add_schema(&self, type_name: &str, schema: Value) {
        self.control_plane
            .schemas
            .lock()
            .await
            .insert(type_name.to_owned(), schema);
    }

    /// Seed an existing resource.
    pub async fn add_resource(&self, type_name: &str, id: &str, properties: Value) {
        self.control_plane.resources.lock().await.insert(
            format!("{type_name}/{id}"),
            properties
                .as_object()
                .expect("properties must be an object")
                .clone(),
        );
    }

    pub async fn resource(&self, type_name: &str, id: &str) -> Option<Map<String, Value>> {
        self.control_plane
            .resources
            .lock()
            .await
            .get(&format!("{type_name}/{id}"))
            .cloned()
    }

    pub async fn requests(&self) -> Vec<(String, String)> {
        self.control_plane.requests.lock().await.clone()
    }

    /// Make every following mutation long-running: 202 with a Location that
    /// stays 202 for `polls` polls.
    pub async fn set_async_polls(&self, polls: usize) {
        *self.control_plane.async_polls.lock().await = Some(polls);
    }

    pub fn schema_fetches(&self) -> usize {
        self.control_plane.schema_fetches.load(Ordering::SeqCst)
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}
