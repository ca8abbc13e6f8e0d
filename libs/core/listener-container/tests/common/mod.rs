#![allow(dead_code)]

use listener_container::testing::{ChannelOp, InMemoryBroker};
use listener_container::{ContainerConfig, ContainerEvent, Delivery, Listener, ListenerError, listener_fn};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Config with intervals short enough for tests
pub fn fast_config(queues: &[&str]) -> ContainerConfig {
    ContainerConfig::new(queues.iter().copied())
        .with_receive_timeout(Duration::from_millis(20))
        .with_monitor_interval(Duration::from_millis(50))
        .with_failed_declaration_retry_interval(Duration::from_millis(100))
        .with_shutdown_timeout(Duration::from_secs(2))
}

pub fn broker_with(queues: &[&str]) -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    for queue in queues {
        broker.declare_queue(queue);
    }
    broker
}

pub fn publish_n(broker: &InMemoryBroker, queue: &str, count: usize) {
    for i in 0..count {
        broker.publish(queue, format!("{queue}-{i}")).unwrap();
    }
}

/// Listener that records every delivery it sees
#[derive(Clone, Default)]
pub struct Recorder {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

impl Recorder {
    pub fn listener(&self) -> Listener {
        self.listener_with(|_| Ok(()))
    }

    /// Record, then answer with `outcome`
    pub fn listener_with<F>(&self, outcome: F) -> Listener
    where
        F: Fn(&Delivery) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let deliveries = self.deliveries.clone();
        let outcome = Arc::new(outcome);
        listener_fn(move |delivery: Delivery| {
            let deliveries = deliveries.clone();
            let outcome = outcome.clone();
            async move {
                let result = outcome(&delivery);
                deliveries.lock().unwrap().push(delivery);
                result
            }
        })
    }

    /// Record, then run `work` before returning
    pub fn async_listener<F, Fut>(&self, work: F) -> Listener
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
    {
        let deliveries = self.deliveries.clone();
        let work = Arc::new(work);
        listener_fn(move |delivery: Delivery| {
            let deliveries = deliveries.clone();
            let work = work.clone();
            async move {
                deliveries.lock().unwrap().push(delivery.clone());
                work(delivery).await
            }
        })
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.deliveries()
            .iter()
            .map(|delivery| delivery.payload_str().unwrap_or_default().to_string())
            .collect()
    }
}

/// Event sink that keeps every event
#[derive(Clone, Default)]
pub struct Events {
    events: Arc<Mutex<Vec<ContainerEvent>>>,
}

impl Events {
    pub fn sink(&self) -> impl Fn(ContainerEvent) + Send + Sync + 'static {
        let events = self.events.clone();
        move |event| events.lock().unwrap().push(event)
    }

    pub fn all(&self) -> Vec<ContainerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.all().iter().filter(|event| event.name() == name).count()
    }
}

pub fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

pub fn load(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

pub fn acks(journal: &[ChannelOp]) -> Vec<(u64, u64, bool)> {
    journal
        .iter()
        .filter_map(|op| match op {
            ChannelOp::Ack {
                channel,
                delivery_tag,
                multiple,
            } => Some((*channel, *delivery_tag, *multiple)),
            _ => None,
        })
        .collect()
}

pub fn nacks(journal: &[ChannelOp]) -> Vec<(u64, bool)> {
    journal
        .iter()
        .filter_map(|op| match op {
            ChannelOp::Nack {
                delivery_tag,
                requeue,
                ..
            } => Some((*delivery_tag, *requeue)),
            _ => None,
        })
        .collect()
}

pub fn commits(journal: &[ChannelOp]) -> usize {
    journal
        .iter()
        .filter(|op| matches!(op, ChannelOp::Commit { .. }))
        .count()
}
