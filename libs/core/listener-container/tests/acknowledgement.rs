mod common;

use async_trait::async_trait;
use common::*;
use listener_container::testing::ChannelOp;
use listener_container::{
    AckMode, BackOffPolicy, Channel, ChannelAwareMessageListener, ContainerConfig, Delivery, Listener,
    ListenerChannel, ListenerContainer, ListenerError, MessageRecoverer, RetryingListener,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_transacted_batch_commits_once() {
    let broker = broker_with(&["orders"]);
    let recorder = Recorder::default();
    let container = ListenerContainer::builder(Arc::new(broker.clone()), recorder.listener())
        .with_config(
            ContainerConfig::new(["orders"])
                .with_channel_transacted(true)
                .with_batch_size(5),
        )
        .build();

    publish_n(&broker, "orders", 5);
    container.start().unwrap();

    assert!(eventually(Duration::from_secs(2), || recorder.count() == 5).await);
    assert!(eventually(Duration::from_secs(2), || broker.unacked_count() == 0).await);

    let journal = broker.journal();
    assert_eq!(commits(&journal), 1);
    assert_eq!(acks(&journal).len(), 1);
    let (_, tag, multiple) = acks(&journal)[0];
    assert_eq!(tag, 5);
    assert!(multiple);

    container.stop().await;
    assert_eq!(commits(&broker.journal()), 1);
}

#[tokio::test]
async fn test_partial_batch_flushed_when_idle() {
    let broker = broker_with(&["orders"]);
    let recorder = Recorder::default();
    let container = ListenerContainer::builder(Arc::new(broker.clone()), recorder.listener())
        .with_config(fast_config(&["orders"]).with_batch_size(10))
        .build();

    publish_n(&broker, "orders", 3);
    container.start().unwrap();

    assert!(eventually(Duration::from_secs(2), || broker.unacked_count() == 0 && recorder.count() == 3).await);
    let acks = acks(&broker.journal());
    assert_eq!(acks.len(), 1);
    assert_eq!((acks[0].1, acks[0].2), (3, true));
    container.stop().await;
}

#[tokio::test]
async fn test_rejected_messages_dead_lettered_and_failures_requeued() {
    let broker = broker_with(&["orders"]);
    let recorder = Recorder::default();
    let listener = recorder.listener_with(|delivery| match delivery.payload_str() {
        Some("poison") => Err(ListenerError::reject("cannot parse")),
        Some("flaky") if !delivery.redelivered => Err(ListenerError::new("database busy")),
        _ => Ok(()),
    });
    let container = ListenerContainer::builder(Arc::new(broker.clone()), listener)
        .with_config(fast_config(&["orders"]))
        .build();
    container.start().unwrap();

    broker.publish("orders", "poison").unwrap();
    broker.publish("orders", "flaky").unwrap();
    broker.publish("orders", "fine").unwrap();

    assert!(eventually(Duration::from_secs(2), || recorder.count() == 4).await);
    assert!(eventually(Duration::from_secs(1), || broker.unacked_count() == 0).await);
    container.stop().await;

    let dead = broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, b"poison".to_vec());

    let flaky: Vec<bool> = recorder
        .deliveries()
        .iter()
        .filter(|delivery| delivery.payload_str() == Some("flaky"))
        .map(|delivery| delivery.redelivered)
        .collect();
    assert_eq!(flaky, vec![false, true]);
    assert_eq!(broker.message_count("orders"), 0);
}

#[tokio::test]
async fn test_default_requeue_disabled_dead_letters_plain_failures() {
    let broker = broker_with(&["orders"]);
    let recorder = Recorder::default();
    let listener = recorder.listener_with(|_| Err(ListenerError::new("always fails")));
    let handled = counter();
    let container = ListenerContainer::builder(Arc::new(broker.clone()), listener)
        .with_config(fast_config(&["orders"]).with_default_requeue_rejected(false))
        .with_error_handler({
            let handled = handled.clone();
            move |_: &Delivery, _: &ListenerError| {
                handled.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build();
    container.start().unwrap();

    publish_n(&broker, "orders", 2);
    assert!(eventually(Duration::from_secs(2), || broker.dead_letters().len() == 2).await);
    assert_eq!(recorder.count(), 2);
    assert_eq!(load(&handled), 2);
    assert!(nacks(&broker.journal()).iter().all(|(_, requeue)| !requeue));
    container.stop().await;
}

struct SelfAcking {
    acked: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl ChannelAwareMessageListener for SelfAcking {
    async fn on_message(&self, delivery: &Delivery, channel: &ListenerChannel) -> Result<(), ListenerError> {
        channel
            .basic_ack(delivery.delivery_tag, false)
            .await
            .map_err(|e| ListenerError::with_source("ack failed", e))?;
        self.acked.lock().unwrap().push(delivery.delivery_tag);
        Ok(())
    }
}

#[tokio::test]
async fn test_manual_mode_leaves_acknowledgement_to_the_listener() {
    let broker = broker_with(&["orders"]);
    let acked = Arc::new(Mutex::new(Vec::new()));
    let container = ListenerContainer::builder(
        Arc::new(broker.clone()),
        Listener::channel_aware(SelfAcking { acked: acked.clone() }),
    )
    .with_config(fast_config(&["orders"]).with_ack_mode(AckMode::Manual))
    .build();
    container.start().unwrap();

    publish_n(&broker, "orders", 3);
    assert!(eventually(Duration::from_secs(2), || acked.lock().unwrap().len() == 3).await);
    assert!(eventually(Duration::from_secs(1), || broker.unacked_count() == 0).await);
    container.stop().await;

    // Only the listener's own acks reach the broker
    assert_eq!(acks(&broker.journal()).len(), 3);
}

#[tokio::test]
async fn test_none_mode_never_acknowledges() {
    let broker = broker_with(&["orders"]);
    let recorder = Recorder::default();
    let listener = recorder.listener_with(|delivery| match delivery.payload_str() {
        Some("bad") => Err(ListenerError::new("ignored")),
        _ => Ok(()),
    });
    let container = ListenerContainer::builder(Arc::new(broker.clone()), listener)
        .with_config(fast_config(&["orders"]).with_ack_mode(AckMode::None))
        .build();
    container.start().unwrap();

    broker.publish("orders", "good").unwrap();
    broker.publish("orders", "bad").unwrap();
    assert!(eventually(Duration::from_secs(2), || recorder.count() == 2).await);
    container.stop().await;

    let journal = broker.journal();
    assert!(acks(&journal).is_empty());
    assert!(nacks(&journal).is_empty());
    assert_eq!(broker.message_count("orders"), 0);
    assert!(broker.dead_letters().is_empty());
}

struct CollectingRecoverer {
    recovered: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MessageRecoverer for CollectingRecoverer {
    async fn recover(&self, delivery: &Delivery, _error: ListenerError) -> Result<(), ListenerError> {
        self.recovered
            .lock()
            .unwrap()
            .push(delivery.payload_str().unwrap_or_default().to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_retrying_listener_inside_container() {
    let broker = broker_with(&["orders"]);
    let recorder = Recorder::default();
    let inner = recorder.listener_with(|delivery| match delivery.payload_str() {
        Some("hopeless") => Err(ListenerError::new("permanent")),
        _ => Ok(()),
    });
    let recovered = Arc::new(Mutex::new(Vec::new()));
    let listener = RetryingListener::new(inner)
        .with_max_attempts(3)
        .with_back_off(BackOffPolicy::fixed_unlimited(Duration::from_millis(5)))
        .with_recoverer(CollectingRecoverer {
            recovered: recovered.clone(),
        })
        .into_listener();
    let container = ListenerContainer::builder(Arc::new(broker.clone()), listener)
        .with_config(fast_config(&["orders"]))
        .build();
    container.start().unwrap();

    broker.publish("orders", "hopeless").unwrap();
    broker.publish("orders", "fine").unwrap();
    assert!(eventually(Duration::from_secs(2), || recorder.count() == 4).await);
    assert!(eventually(Duration::from_secs(1), || broker.unacked_count() == 0).await);
    container.stop().await;

    // Three attempts for the failing message, then the recoverer acknowledged it
    assert_eq!(*recovered.lock().unwrap(), vec!["hopeless".to_string()]);
    assert_eq!(acks(&broker.journal()).len(), 2);
    assert!(broker.dead_letters().is_empty());
    assert!(!broker
        .journal()
        .iter()
        .any(|op| matches!(op, ChannelOp::Nack { .. })));
}
