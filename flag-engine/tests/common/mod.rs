#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use flag_engine::analytics::analytics_models::EvaluationRecord;
use flag_engine::config::DEFAULT_TEST_CONFIG;
use flag_engine::server::Engine;
use flag_engine::test_utils::MemoryStore;

/// An engine over an in-memory store, driven in-process through the router.
pub struct TestEngine {
    pub store: Arc<MemoryStore>,
    engine: Engine,
}

impl TestEngine {
    pub fn start() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        let engine = Engine::start(&DEFAULT_TEST_CONFIG, store.clone(), None)
            .expect("default test config is valid");
        TestEngine { store, engine }
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("failed to build request");

        let response = self
            .engine
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read body")
            .to_bytes();
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(body)).await
    }

    pub async fn put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::PUT, uri, Some(body)).await
    }

    pub async fn patch(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::PATCH, uri, None).await
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::DELETE, uri, None).await
    }

    /// Creates a flag through the admin API and returns its id.
    pub async fn create_flag(&self, name: &str, enabled: bool, rollout: i32) -> String {
        let (status, body) = self
            .post(
                "/api/flags",
                json!({"name": name, "enabled": enabled, "rollout_percentage": rollout}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create {name}: {body}");
        body["id"].as_str().expect("flag id").to_string()
    }

    /// Adds a rule through the admin API and returns its id.
    pub async fn add_rule(&self, flag_id: &str, rule_type: &str, value: &str, priority: i32) -> String {
        let (status, body) = self
            .post(
                &format!("/api/flags/{flag_id}/rules"),
                json!({"rule_type": rule_type, "rule_value": value, "priority": priority}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "add rule: {body}");
        body["id"].as_str().expect("rule id").to_string()
    }

    pub async fn evaluate(&self, body: Value) -> (StatusCode, Value) {
        self.post("/api/flags/evaluate", body).await
    }

    /// Waits for the recorder to flush at least `expected` records.
    pub async fn wait_for_records(&self, expected: usize) -> Vec<EvaluationRecord> {
        for _ in 0..200 {
            let records = self.store.records();
            if records.len() >= expected {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} records, found {}",
            expected,
            self.store.records().len()
        );
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await;
    }
}
