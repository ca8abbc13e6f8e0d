//! Channel handed to listeners.
//!
//! Listeners get a decorated channel: `close` is suppressed because the
//! consumer owns the channel's lifetime, and publisher confirms are tracked so
//! the container can tell whether a listener switched them on.

use crate::client::{Channel, DeliveryCallback};
use crate::delivery::{Delivery, MessageProperties};
use crate::error::ClientError;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub struct ListenerChannel {
    target: Arc<dyn Channel>,
    physical_close: AtomicBool,
    confirm_selected: AtomicBool,
}

impl ListenerChannel {
    pub fn new(target: Arc<dyn Channel>) -> Self {
        Self {
            target,
            physical_close: AtomicBool::new(false),
            confirm_selected: AtomicBool::new(false),
        }
    }

    /// The undecorated channel
    pub fn target(&self) -> &Arc<dyn Channel> {
        &self.target
    }

    pub fn is_confirm_selected(&self) -> bool {
        self.confirm_selected.load(Ordering::Acquire)
    }

    /// Close the underlying channel; later `close` calls pass through too.
    pub(crate) async fn close_physically(&self) -> Result<(), ClientError> {
        self.physical_close.store(true, Ordering::Release);
        if self.target.is_open() {
            self.target.close().await
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for ListenerChannel {
    fn channel_number(&self) -> u16 {
        self.target.channel_number()
    }

    fn is_open(&self) -> bool {
        self.target.is_open()
    }

    fn is_transactional(&self) -> bool {
        self.target.is_transactional()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), ClientError> {
        self.target.basic_qos(prefetch_count).await
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<String, ClientError> {
        self.target
            .basic_consume(queue, consumer_tag, auto_ack, callback)
            .await
    }

    async fn basic_get(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>, ClientError> {
        self.target.basic_get(queue, auto_ack).await
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), ClientError> {
        self.target.basic_ack(delivery_tag, multiple).await
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), ClientError> {
        self.target.basic_nack(delivery_tag, multiple, requeue).await
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), ClientError> {
        self.target.basic_cancel(consumer_tag).await
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), ClientError> {
        self.target
            .basic_publish(exchange, routing_key, payload, properties)
            .await
    }

    async fn tx_commit(&self) -> Result<(), ClientError> {
        self.target.tx_commit().await
    }

    async fn tx_rollback(&self) -> Result<(), ClientError> {
        self.target.tx_rollback().await
    }

    async fn confirm_select(&self) -> Result<(), ClientError> {
        self.target.confirm_select().await?;
        self.confirm_selected.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        if self.physical_close.load(Ordering::Acquire) {
            return self.target.close().await;
        }
        debug!(
            channel = self.target.channel_number(),
            "Ignoring close of a container-managed channel"
        );
        Ok(())
    }
}
