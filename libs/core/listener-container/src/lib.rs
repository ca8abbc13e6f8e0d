//! Message Listener Container
//!
//! Runs message listeners against broker queues and keeps them running.
//!
//! ## Features
//!
//! - **Consumers**: one task and one channel per consumer, push or pull delivery
//! - **Acknowledgement policy**: NONE / AUTO / MANUAL, batched acks, channel transactions
//! - **External transactions**: acks follow the outcome of a [`TransactionManager`]
//! - **Adaptive scaling**: consumers per queue move between min and max with load
//! - **Recovery**: missing queues pause and resume; broker outages retry under a back-off
//! - **Retry interceptor**: stateless retries with a [`MessageRecoverer`] fallback
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use listener_container::{listener_fn, ContainerConfig, ListenerContainer};
//!
//! let listener = listener_fn(|delivery: Delivery| async move {
//!     process(&delivery.payload).await?;
//!     Ok(())
//! });
//!
//! let container = ListenerContainer::builder(connection_factory, listener)
//!     .with_config(ContainerConfig::new(["orders"]).with_concurrency(1, 4))
//!     .with_event_sink(|event: ContainerEvent| tracing::info!(event = event.name()))
//!     .build();
//!
//! container.start()?;
//! shutdown_signal().await;
//! container.stop().await;
//! ```

mod ack;
mod backoff;
mod channel;
mod client;
mod config;
mod consumer;
mod container;
mod delivery;
mod error;
mod events;
mod health;
mod listener;
pub mod metrics;
mod recovery;
mod retry;
mod scaling;
mod sync;
pub mod testing;
mod transaction;

// Re-export main types
pub use ack::{AckAction, AckContext, AckMode, ListenerOutcome, decide};
pub use backoff::{BackOffExecution, BackOffPolicy};
pub use channel::ListenerChannel;
pub use client::{
    Channel, Connection, ConnectionFactory, ConsumerTagStrategy, DeliveryCallback, DeliveryMode,
    QueueDeclarer,
};
pub use config::ContainerConfig;
pub use consumer::{ConsumerSnapshot, ConsumerState};
pub use container::{
    ContainerSnapshot, ContainerState, ListenerContainer, ListenerContainerBuilder, QueueSnapshot,
};
pub use delivery::{Delivery, MessageProperties};
pub use error::{ClientError, ContainerError, FailureKind, ListenerError};
pub use events::{BroadcastEventSink, ContainerEvent, EventSink};
pub use health::{HealthState, health_router};
pub use listener::{
    ChannelAwareMessageListener, ErrorHandler, FnListener, Listener, LoggingErrorHandler,
    MessageListener, NoOpListener, listener_fn,
};
pub use metrics::{ListenerMetrics, init_metrics};
pub use recovery::{QueueState, RecoveryAction, RecoverySettings, RecoverySupervisor};
pub use retry::{MessageRecoverer, RejectAndDontRequeueRecoverer, RetryingListener};
pub use scaling::{ConcurrencyBounds, ConsumerSample, ScalingController, ScalingDecision, ScalingSettings};
pub use transaction::{
    ExternalTransaction, TransactionError, TransactionManager, TransactionOutcome,
    TransactionSynchronization,
};
