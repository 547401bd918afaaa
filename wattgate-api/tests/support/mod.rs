//! Shared helpers for the wattgate-api integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, Response},
    Router,
};
use secrecy::SecretString;
use serde_json::Value;
use wattgate_api::{create_router, AppState, GatewayConfig};
use wattgate_storage::BindingStore;
use wattgate_test_utils::fixtures::{session_token, TEST_SESSION_SECRET};
use wattgate_test_utils::{FakeUpstream, InMemoryStore, SharedStore};

pub const COOKIE: &str = "wattgate_session";

/// Configuration with test secrets and fast retries.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        refresh_token: Some(SecretString::from("test-refresh-credential".to_string())),
        session_secret: Some(SecretString::from(TEST_SESSION_SECRET.to_string())),
        session_cookie: COOKIE.to_string(),
        retry_base_delay: Duration::from_millis(5),
        lock_timeout: Duration::from_millis(100),
        ..GatewayConfig::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub upstream: Arc<FakeUpstream>,
    pub store: Arc<dyn SharedStore>,
}

impl TestApp {
    pub fn new(upstream: FakeUpstream) -> Self {
        Self::with(test_config(), upstream, Arc::new(InMemoryStore::new()))
    }

    pub fn with(config: GatewayConfig, upstream: FakeUpstream, store: Arc<dyn SharedStore>) -> Self {
        let upstream = Arc::new(upstream);
        let state = AppState::new(config, upstream.clone(), Arc::clone(&store));
        Self {
            router: create_router(state),
            upstream,
            store,
        }
    }

    /// Bind `session_id` to `customer_id` the way the login flow would.
    pub async fn bind(&self, session_id: &str, customer_id: &str) {
        BindingStore::new(Arc::clone(&self.store))
            .bind(session_id, customer_id, None)
            .await
            .expect("binding should be stored");
    }

    pub async fn send(&self, request: Request<Body>) -> (u16, Option<String>, Value) {
        use tower::ServiceExt;
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        read(response).await
    }
}

pub async fn read(response: Response<Body>) -> (u16, Option<String>, Value) {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    let body = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, retry_after, body)
}

/// POST /api/gateway with a JSON body and an optional session cookie.
pub fn gateway_post(body: Value, session_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/gateway")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(session_id) = session_id {
        builder = builder.header(
            header::COOKIE,
            format!("{}={}", COOKIE, session_token(session_id)),
        );
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}
