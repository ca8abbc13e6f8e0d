//! Prometheus metrics for listener containers
//!
//! Provides observability into consumer throughput, acknowledgements and recovery.

use crate::error::FailureKind;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use strum::AsRefStr;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls return the installed handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// What happened to a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    Failed,
    RejectedWhileStopping,
}

/// Channel operation issued by the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ChannelOperation {
    Ack,
    Nack,
    Commit,
    Rollback,
}

/// Per-queue metrics helper
#[derive(Clone)]
pub struct ListenerMetrics {
    queue: String,
}

impl ListenerMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    pub fn delivery(&self, outcome: DeliveryOutcome) {
        counter!(
            "listener_container_deliveries_total",
            "queue" => self.queue.clone(),
            "outcome" => outcome.as_ref().to_string()
        )
        .increment(1);
    }

    pub fn listener_duration(&self, duration: Duration) {
        histogram!(
            "listener_container_listener_duration_seconds",
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn channel_operation(&self, operation: ChannelOperation) {
        counter!(
            "listener_container_channel_operations_total",
            "queue" => self.queue.clone(),
            "operation" => operation.as_ref().to_string()
        )
        .increment(1);
    }

    pub fn consumer_failed(&self, kind: FailureKind) {
        counter!(
            "listener_container_consumer_failures_total",
            "queue" => self.queue.clone(),
            "kind" => kind.as_ref().to_string()
        )
        .increment(1);
    }

    pub fn consumers(&self, count: usize) {
        gauge!(
            "listener_container_consumers",
            "queue" => self.queue.clone()
        )
        .set(count as f64);
    }
}

/// Record a container stop
pub fn container_stopped(fatal: bool) {
    counter!(
        "listener_container_stops_total",
        "fatal" => fatal.to_string()
    )
    .increment(1);
}
