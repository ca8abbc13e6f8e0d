//! Error types and failure classification
//!
//! Broker failures are classified to decide how the container reacts:
//! - **MissingQueue**: the queue is gone; pause it or stop, per `missing_queues_fatal`
//! - **Authentication**: credentials rejected; fatal unless configured otherwise
//! - **Connection**: broker unreachable; restart under the recovery back-off
//! - **Channel**: one channel broke; restart that consumer on the next monitor tick
//! - **Cancelled**: the broker cancelled the consumer; restart on the next monitor tick

use crate::container::ContainerState;
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Category of a broker-side failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    MissingQueue,
    Authentication,
    Connection,
    Channel,
    Cancelled,
}

impl FailureKind {
    /// Whether the failure concerns the broker as a whole rather than one consumer
    pub fn is_systemic(&self) -> bool {
        matches!(self, FailureKind::Connection | FailureKind::Authentication)
    }
}

/// Errors reported by the broker client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Queue '{queue}' not found")]
    QueueNotFound { queue: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Consumer '{consumer_tag}' was cancelled by the broker")]
    Cancelled { consumer_tag: String },

    #[error("Channel is closed")]
    ChannelClosed,
}

impl ClientError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ClientError::Connection(_) => FailureKind::Connection,
            ClientError::Authentication(_) => FailureKind::Authentication,
            ClientError::QueueNotFound { .. } => FailureKind::MissingQueue,
            ClientError::Channel(_) | ClientError::ChannelClosed => FailureKind::Channel,
            ClientError::Cancelled { .. } => FailureKind::Cancelled,
        }
    }

    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        ClientError::QueueNotFound {
            queue: queue.into(),
        }
    }
}

/// Error returned by a message listener
#[derive(Error, Debug)]
pub enum ListenerError {
    /// Application failure; `requeue` overrides the container default when set
    #[error("Listener failed: {message}")]
    Failed {
        message: String,
        requeue: Option<bool>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Listener panicked: {0}")]
    Panicked(String),

    /// A channel operation performed by the listener itself failed
    #[error("Channel operation failed inside listener: {0}")]
    Transport(#[from] ClientError),
}

impl ListenerError {
    /// Failure that follows the container's `default_requeue_rejected`
    pub fn new(message: impl Into<String>) -> Self {
        ListenerError::Failed {
            message: message.into(),
            requeue: None,
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ListenerError::Failed {
            message: message.into(),
            requeue: None,
            source: Some(Box::new(source)),
        }
    }

    /// Failure whose delivery must not be requeued
    pub fn reject(message: impl Into<String>) -> Self {
        ListenerError::Failed {
            message: message.into(),
            requeue: Some(false),
            source: None,
        }
    }

    /// Failure whose delivery must be requeued
    pub fn requeue(message: impl Into<String>) -> Self {
        ListenerError::Failed {
            message: message.into(),
            requeue: Some(true),
            source: None,
        }
    }

    pub fn requeue_override(&self) -> Option<bool> {
        match self {
            ListenerError::Failed { requeue, .. } => *requeue,
            ListenerError::Panicked(_) | ListenerError::Transport(_) => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ListenerError::Transport(_))
    }
}

/// Container lifecycle and configuration errors
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Invalid container configuration: {0}")]
    Config(String),

    #[error("Cannot {operation} while the container is {state}")]
    IllegalState {
        state: ContainerState,
        operation: &'static str,
    },

    #[error("Queue '{0}' is already registered")]
    DuplicateQueue(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl ContainerError {
    pub fn config(message: impl Into<String>) -> Self {
        ContainerError::Config(message.into())
    }
}
