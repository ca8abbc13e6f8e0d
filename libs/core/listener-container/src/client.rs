//! Broker client seams
//!
//! The container drives a broker only through these traits. Production code
//! plugs in an AMQP client; tests use [`crate::testing::InMemoryBroker`].

use crate::delivery::{Delivery, MessageProperties};
use crate::error::ClientError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Creates broker connections
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(&self) -> Result<Arc<dyn Connection>, ClientError>;
}

/// A broker connection that multiplexes channels
#[async_trait]
pub trait Connection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self, transactional: bool) -> Result<Arc<dyn Channel>, ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}

/// Receives pushed deliveries and consumer lifecycle notifications
#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    async fn on_delivery(&self, consumer_tag: &str, delivery: Delivery);

    /// The broker cancelled the consumer (for example, its queue was deleted)
    async fn on_cancel(&self, consumer_tag: &str);

    /// The channel or connection shut down underneath the consumer
    async fn on_shutdown(&self, cause: ClientError);
}

/// One channel on a connection
#[async_trait]
pub trait Channel: Send + Sync {
    fn channel_number(&self) -> u16;

    fn is_open(&self) -> bool;

    fn is_transactional(&self) -> bool;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), ClientError>;

    /// Register a push consumer. An empty `consumer_tag` lets the broker pick one;
    /// the effective tag is returned once the broker confirms registration.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<String, ClientError>;

    async fn basic_get(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>, ClientError>;

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), ClientError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), ClientError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), ClientError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), ClientError>;

    async fn tx_commit(&self) -> Result<(), ClientError>;

    async fn tx_rollback(&self) -> Result<(), ClientError>;

    async fn confirm_select(&self) -> Result<(), ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}

/// Checks or re-declares queues while they are missing
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueDeclarer: Send + Sync {
    /// Returns whether the queue exists after the call
    async fn declare_queue(&self, queue: &str) -> Result<bool, ClientError>;
}

/// How a consumer obtains deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Broker pushes deliveries to a registered consumer
    #[default]
    Push,
    /// Consumer polls with `basic_get`, sleeping `poll_interval` on an empty queue
    Pull { poll_interval: Duration },
}

/// Builds a consumer tag for a queue; an empty tag lets the broker choose
pub type ConsumerTagStrategy = Arc<dyn Fn(&str) -> String + Send + Sync>;
