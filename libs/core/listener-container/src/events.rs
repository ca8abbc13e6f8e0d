//! Container lifecycle events
//!
//! Events are published fire-and-forget to an optional [`EventSink`]. A sink
//! that panics is logged and ignored. Sinks run inline on the publishing
//! consumer or monitor task and must not block; use [`BroadcastEventSink`]
//! to hand events to slower subscribers.

use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerEvent {
    ContainerStarted,
    ConsumeOk {
        queue: String,
        consumer_tag: String,
    },
    /// No delivery arrived for at least the configured idle interval
    Idle {
        queue: String,
        consumer_tag: String,
        idle_since: DateTime<Utc>,
        idle_for: Duration,
    },
    ConsumerFailed {
        queue: String,
        consumer_tag: Option<String>,
        kind: FailureKind,
        reason: String,
    },
    ConsumerTerminated {
        queue: String,
        consumer_tag: Option<String>,
    },
    QueueMissing {
        queue: String,
    },
    QueueRecovered {
        queue: String,
    },
    ContainerStopped {
        fatal: bool,
        reason: Option<String>,
    },
}

impl ContainerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ContainerEvent::ContainerStarted => "container_started",
            ContainerEvent::ConsumeOk { .. } => "consume_ok",
            ContainerEvent::Idle { .. } => "idle",
            ContainerEvent::ConsumerFailed { .. } => "consumer_failed",
            ContainerEvent::ConsumerTerminated { .. } => "consumer_terminated",
            ContainerEvent::QueueMissing { .. } => "queue_missing",
            ContainerEvent::QueueRecovered { .. } => "queue_recovered",
            ContainerEvent::ContainerStopped { .. } => "container_stopped",
        }
    }

    pub fn queue(&self) -> Option<&str> {
        match self {
            ContainerEvent::ConsumeOk { queue, .. }
            | ContainerEvent::Idle { queue, .. }
            | ContainerEvent::ConsumerFailed { queue, .. }
            | ContainerEvent::ConsumerTerminated { queue, .. }
            | ContainerEvent::QueueMissing { queue }
            | ContainerEvent::QueueRecovered { queue } => Some(queue),
            ContainerEvent::ContainerStarted | ContainerEvent::ContainerStopped { .. } => None,
        }
    }
}

/// Receives container events; called on the publishing task, so it must not block
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: ContainerEvent);
}

impl<F> EventSink for F
where
    F: Fn(ContainerEvent) + Send + Sync,
{
    fn on_event(&self, event: ContainerEvent) {
        self(event)
    }
}

/// Fans events out to any number of `tokio::sync::broadcast` subscribers
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<ContainerEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn on_event(&self, event: ContainerEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[derive(Clone, Default)]
pub(crate) struct EventPublisher {
    sink: Option<Arc<dyn EventSink>>,
}

impl EventPublisher {
    pub(crate) fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Self { sink }
    }

    pub(crate) fn publish(&self, event: ContainerEvent) {
        debug!(event = event.name(), queue = ?event.queue(), "Publishing container event");
        let Some(sink) = &self.sink else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| sink.on_event(event))).is_err() {
            warn!("Event sink panicked; event dropped");
        }
    }
}
