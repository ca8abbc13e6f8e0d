//! Health check handlers for listener containers.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Consumer monitoring (`/consumers`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::container::{ContainerSnapshot, ListenerContainer};
use crate::metrics;
use crate::recovery::QueueState;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Container to report on.
    pub container: Arc<ListenerContainer>,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        container: Arc<ListenerContainer>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            container,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

fn unhealthy_queues(snapshot: &ContainerSnapshot) -> Vec<Value> {
    snapshot
        .queues
        .iter()
        .filter(|queue| matches!(queue.state, Some(QueueState::Missing | QueueState::Fatal)))
        .map(|queue| json!({ "queue": queue.name, "state": queue.state }))
        .collect()
}

/// Readiness probe handler.
///
/// Ready while the container is running and no queue is missing or failed.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let snapshot = state.container.snapshot();
    let body = json!({
        "status": if snapshot.is_ready() { "ready" } else { "not_ready" },
        "checks": {
            "container": snapshot.state,
            "unhealthy_queues": unhealthy_queues(&snapshot),
        }
    });

    if snapshot.is_ready() {
        Ok((StatusCode::OK, Json(body)))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}

/// Queue and consumer snapshot for monitoring.
pub async fn consumers_handler(State(state): State<HealthState>) -> Json<ContainerSnapshot> {
    Json(state.container.snapshot())
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create the health router.
///
/// - `/health`, `/healthz` - Liveness probe
/// - `/ready`, `/readyz` - Readiness probe
/// - `/consumers` - Container snapshot
/// - `/metrics` - Prometheus metrics
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/consumers", get(consumers_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;
    use crate::listener::{Listener, NoOpListener};
    use crate::testing::InMemoryBroker;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(broker: &InMemoryBroker) -> HealthState {
        let container = ListenerContainer::builder(Arc::new(broker.clone()), Listener::plain(NoOpListener))
            .with_config(ContainerConfig::new(["orders"]))
            .build();
        HealthState::new(Arc::new(container), "listener-worker", "0.1.0")
    }

    async fn get(router: axum::Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            name: "test-worker".to_string(),
            version: "1.0.0".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"name\":\"test-worker\""));
    }

    #[tokio::test]
    async fn test_liveness() {
        let broker = InMemoryBroker::new();
        let (status, body) = get(health_router(state(&broker)), "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "listener-worker");
    }

    #[tokio::test]
    async fn test_readiness_follows_container_state() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        let state = state(&broker);
        let router = health_router(state.clone());

        let (status, body) = get(router.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["container"], "CREATED");

        state.container.start().unwrap();
        let (status, body) = get(router.clone(), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");

        let (status, body) = get(router, "/consumers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "RUNNING");
        assert_eq!(body["queues"][0]["name"], "orders");
        assert_eq!(body["queues"][0]["consumers"].as_array().map(Vec::len), Some(1));

        state.container.stop().await;
    }
}
