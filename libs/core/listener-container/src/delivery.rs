//! Delivery wrapper
//!
//! A message handed to a consumer, with the broker metadata needed to
//! acknowledge it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Message properties carried alongside the payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub headers: HashMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A message delivered to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the message was consumed from
    pub queue: String,

    /// Channel-scoped, monotonically increasing tag used for acknowledgement
    pub delivery_tag: u64,

    /// Consumer tag the broker delivered to (empty for polled deliveries)
    pub consumer_tag: String,

    pub payload: Vec<u8>,

    /// Whether the broker delivered this message before
    pub redelivered: bool,

    pub properties: MessageProperties,

    /// When the client received the message
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, delivery_tag: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            queue: queue.into(),
            delivery_tag,
            consumer_tag: String::new(),
            payload: payload.into(),
            redelivered: false,
            properties: MessageProperties::default(),
            received_at: Utc::now(),
        }
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Payload as UTF-8, if it is valid
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Get how long ago the message was received
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.received_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let delivery = Delivery::new("orders", 7, "hello")
            .with_consumer_tag("amq.ctag-1")
            .with_redelivered(true);

        assert_eq!(delivery.queue, "orders");
        assert_eq!(delivery.delivery_tag, 7);
        assert_eq!(delivery.consumer_tag, "amq.ctag-1");
        assert_eq!(delivery.payload_str(), Some("hello"));
        assert!(delivery.redelivered);
        assert!(delivery.age().num_milliseconds() < 1000);
    }

    #[test]
    fn test_binary_payload() {
        let delivery = Delivery::new("bin", 1, vec![0xff, 0xfe]);
        assert_eq!(delivery.payload_str(), None);
    }
}
