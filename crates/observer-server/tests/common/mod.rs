#![allow(dead_code)]

use anyhow::Result;
use axum::body::{to_bytes, Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use observer_server::app;
use observer_server::config::ServerConfig;
use observer_server::state::AppState;
use observer_storage::{StorageEngine, VolatileStore};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

pub struct TestContext {
    pub temp_dir: TempDir,
    pub state: AppState,
    pub app: axum::Router,
}

/// Server config with snapshots disabled.
pub fn memory_config() -> ServerConfig {
    ServerConfig {
        file_storage_path: None,
        ..ServerConfig::default()
    }
}

pub fn build_test_context() -> Result<TestContext> {
    build_test_context_with(memory_config(), Arc::new(VolatileStore::new()))
}

pub fn build_test_context_with(
    config: ServerConfig,
    storage: Arc<dyn StorageEngine>,
) -> Result<TestContext> {
    let temp_dir = tempfile::tempdir()?;
    let state = AppState::new(storage, config, CancellationToken::new())?;
    let app = app::build_http_app(state.clone());
    Ok(TestContext {
        temp_dir,
        state,
        app,
    })
}

pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub async fn send(app: &axum::Router, req: Request<Body>) -> RawResponse {
    let resp = app
        .clone()
        .oneshot(req)
        .await
        .expect("request should be handled");
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body should read");
    RawResponse {
        status,
        headers,
        body,
    }
}

pub async fn request_json(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value, Option<String>) {
    let req_body = body.map(|b| b.to_string()).unwrap_or_default();
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(req_body))
        .expect("request should build");
    let resp = send(app, req).await;
    let trace_id = resp.header("x-trace-id").map(str::to_string);
    let json = if resp.body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&resp.body).unwrap_or_else(|_| Value::String(resp.text()))
    };
    (resp.status, json, trace_id)
}

pub async fn request_no_body(app: &axum::Router, method: &str, uri: &str) -> RawResponse {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    send(app, req).await
}

/// Builds a POST with an exact byte body and extra headers.
pub fn post_bytes(uri: &str, body: Vec<u8>, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body)).expect("request should build")
}
