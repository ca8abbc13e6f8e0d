//! Listener Worker Service
//!
//! Runs a [`ListenerContainer`] against an in-process broker and serves the
//! container's health, readiness and metrics endpoints.
//!
//! ## Architecture
//!
//! ```text
//! InMemoryBroker (queues from LISTENER_QUEUES)
//!   ↓ (push consumers, prefetch + ack policy)
//! ListenerContainer
//!   ↓ (one task per consumer, adaptive scaling, recovery)
//! Demo listener (logs each delivery, rejects "poison" payloads)
//! ```
//!
//! ## Environment
//!
//! - `LISTENER_*`: container settings, see [`ContainerConfig`]
//! - `HEALTH_HOST`, `HEALTH_PORT`: health server address
//! - `LISTENER_DEMO_MESSAGES`: messages published to each queue at startup

use axum::Router;
use core_config::server::HealthServerConfig;
use core_config::{ConfigError, Environment, FromEnv, env_parse};
use eyre::{Result, WrapErr};
use listener_container::testing::InMemoryBroker;
use listener_container::{
    ContainerConfig, ContainerEvent, Delivery, HealthState, ListenerContainer, ListenerError,
    health_router, init_metrics, listener_fn,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_QUEUE: &str = "demo";

/// Settings for the demo traffic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DemoConfig {
    /// Messages published to each queue at startup
    pub messages_per_queue: usize,
}

impl FromEnv for DemoConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            messages_per_queue: env_parse("LISTENER_DEMO_MESSAGES", 10)?,
        })
    }
}

/// Container settings from the environment, consuming `demo` when no queue is configured
pub fn load_container_config() -> Result<ContainerConfig> {
    let mut config = ContainerConfig::from_env().wrap_err("Failed to load listener configuration")?;
    if config.queue_names.is_empty() {
        config.queue_names.push(DEFAULT_QUEUE.to_string());
    }
    Ok(config)
}

async fn handle_delivery(delivery: Delivery) -> Result<(), ListenerError> {
    match delivery.payload_str() {
        Some("poison") => Err(ListenerError::reject("poison message")),
        Some(payload) => {
            info!(
                queue = %delivery.queue,
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered,
                payload,
                "Processed message"
            );
            Ok(())
        }
        None => Err(ListenerError::reject("payload is not UTF-8")),
    }
}

fn log_event(event: ContainerEvent) {
    match &event {
        ContainerEvent::ConsumerFailed { queue, kind, reason, .. } => {
            warn!(queue = %queue, kind = %kind, reason = %reason, "Consumer failed");
        }
        ContainerEvent::QueueMissing { queue } => warn!(queue = %queue, "Queue missing"),
        ContainerEvent::ContainerStopped { fatal: true, reason } => {
            error!(reason = ?reason, "Container stopped after an unrecoverable failure");
        }
        _ => info!(event = event.name(), queue = ?event.queue(), "Container event"),
    }
}

/// Start the health HTTP server
///
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Consumer monitoring: `/consumers`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(state: HealthState, config: HealthServerConfig) -> Result<()> {
    let app: Router = health_router(state);

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the listener worker
///
/// 1. Sets up structured logging (JSON for prod, pretty for dev)
/// 2. Loads container, health and demo settings from the environment
/// 3. Declares the queues and publishes the demo messages
/// 4. Starts the container and waits for a shutdown signal
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the container
/// refuses to start.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Prometheus metrics unavailable");
    }

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, "Starting listener worker");

    let container_config = load_container_config()?;
    let health_config =
        HealthServerConfig::from_env().wrap_err("Failed to load health server configuration")?;
    let demo = DemoConfig::from_env().wrap_err("Failed to load demo configuration")?;

    let broker = InMemoryBroker::new();
    for queue in &container_config.queue_names {
        broker.declare_queue(queue);
        for i in 0..demo.messages_per_queue {
            broker
                .publish(queue, format!("{queue} message {i}"))
                .wrap_err_with(|| format!("Failed to publish to {queue}"))?;
        }
    }
    info!(
        queues = ?container_config.queue_names,
        messages_per_queue = demo.messages_per_queue,
        "Demo broker ready"
    );

    let container = Arc::new(
        ListenerContainer::builder(Arc::new(broker.clone()), listener_fn(handle_delivery))
            .with_config(container_config)
            .with_queue_declarer(Arc::new(broker))
            .with_event_sink(log_event)
            .build(),
    );

    let health_state = HealthState::new(container.clone(), name, version);
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_config).await {
            error!(error = %e, "Health server failed");
        }
    });

    container.start().wrap_err("Failed to start listener container")?;

    shutdown_signal().await?;
    container.stop().await;

    info!("Listener worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        terminate.recv().await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_config_defaults() {
        temp_env::with_var_unset("LISTENER_DEMO_MESSAGES", || {
            assert_eq!(DemoConfig::from_env().unwrap().messages_per_queue, 10);
        });
        temp_env::with_var("LISTENER_DEMO_MESSAGES", Some("3"), || {
            assert_eq!(DemoConfig::from_env().unwrap().messages_per_queue, 3);
        });
    }

    #[test]
    fn test_default_queue_when_none_configured() {
        temp_env::with_var_unset("LISTENER_QUEUES", || {
            let config = load_container_config().unwrap();
            assert_eq!(config.queue_names, vec![DEFAULT_QUEUE]);
        });
        temp_env::with_var("LISTENER_QUEUES", Some("orders,invoices"), || {
            let config = load_container_config().unwrap();
            assert_eq!(config.queue_names, vec!["orders", "invoices"]);
        });
    }

    #[tokio::test]
    async fn test_demo_listener_rejects_poison() {
        let ok = handle_delivery(Delivery::new("demo", 1, "hello")).await;
        assert!(ok.is_ok());

        let poison = handle_delivery(Delivery::new("demo", 2, "poison")).await.unwrap_err();
        assert_eq!(poison.requeue_override(), Some(false));
    }
}
