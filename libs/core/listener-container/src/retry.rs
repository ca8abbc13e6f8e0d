//! Stateless retry around a listener
//!
//! [`RetryingListener`] re-invokes the wrapped listener in place, sleeping per
//! its [`BackOffPolicy`] between attempts. When attempts run out the
//! [`MessageRecoverer`] decides the delivery's fate; the default recoverer
//! rejects it without requeue so it is dead-lettered instead of looping.

use crate::backoff::BackOffPolicy;
use crate::channel::ListenerChannel;
use crate::delivery::Delivery;
use crate::error::ListenerError;
use crate::listener::{ChannelAwareMessageListener, Listener};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Decides what happens to a delivery after the last failed attempt
#[async_trait]
pub trait MessageRecoverer: Send + Sync {
    /// `Ok` acknowledges the delivery; `Err` hands the error to the ack policy
    async fn recover(&self, delivery: &Delivery, error: ListenerError) -> Result<(), ListenerError>;
}

/// Rejects the delivery without requeue
pub struct RejectAndDontRequeueRecoverer;

#[async_trait]
impl MessageRecoverer for RejectAndDontRequeueRecoverer {
    async fn recover(&self, delivery: &Delivery, error: ListenerError) -> Result<(), ListenerError> {
        warn!(
            queue = %delivery.queue,
            delivery_tag = delivery.delivery_tag,
            error = %error,
            "Retries exhausted; rejecting delivery"
        );
        Err(ListenerError::reject(format!("retry policy exhausted: {error}")))
    }
}

pub struct RetryingListener {
    inner: Listener,
    max_attempts: u32,
    back_off: BackOffPolicy,
    recoverer: Arc<dyn MessageRecoverer>,
}

impl RetryingListener {
    /// Three attempts, exponential back-off 1s x2 up to 10s, reject on exhaustion
    pub fn new(inner: Listener) -> Self {
        Self {
            inner,
            max_attempts: 3,
            back_off: BackOffPolicy::exponential(
                Duration::from_secs(1),
                2.0,
                Duration::from_secs(10),
            ),
            recoverer: Arc::new(RejectAndDontRequeueRecoverer),
        }
    }

    /// Total invocations, including the first
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_back_off(mut self, back_off: BackOffPolicy) -> Self {
        self.back_off = back_off;
        self
    }

    pub fn with_recoverer(mut self, recoverer: impl MessageRecoverer + 'static) -> Self {
        self.recoverer = Arc::new(recoverer);
        self
    }

    pub fn into_listener(self) -> Listener {
        Listener::channel_aware(self)
    }

    fn delay_before_retry(&self, retry: u32) -> Duration {
        // The attempt limit is ours; the policy only supplies the spacing
        self.back_off
            .clone()
            .with_max_attempts(u32::MAX)
            .delay_for_attempt(retry)
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChannelAwareMessageListener for RetryingListener {
    async fn on_message(
        &self,
        delivery: &Delivery,
        channel: &ListenerChannel,
    ) -> Result<(), ListenerError> {
        let mut attempt = 1;
        loop {
            let error = match self.inner.invoke(delivery, channel).await {
                Ok(()) => return Ok(()),
                // Broken channels are the container's business, not a retry
                Err(error) if error.is_transport() => return Err(error),
                Err(error) => error,
            };

            if attempt >= self.max_attempts {
                return self.recoverer.recover(delivery, error).await;
            }

            let delay = self.delay_before_retry(attempt);
            debug!(
                queue = %delivery.queue,
                delivery_tag = delivery.delivery_tag,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Listener failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Connection, ConnectionFactory};
    use crate::listener::listener_fn;
    use crate::testing::InMemoryBroker;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn channel() -> (InMemoryBroker, ListenerChannel) {
        let broker = InMemoryBroker::new();
        let connection = broker.create_connection().await.unwrap();
        let channel = connection.create_channel(false).await.unwrap();
        (broker, ListenerChannel::new(channel))
    }

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> Listener {
        listener_fn(move |_delivery: Delivery| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(ListenerError::new("transient"))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_within_attempts() {
        let (_broker, channel) = channel().await;
        let calls = Arc::new(AtomicU32::new(0));
        let listener = RetryingListener::new(flaky(2, calls.clone()))
            .with_max_attempts(3)
            .with_back_off(BackOffPolicy::fixed_unlimited(Duration::from_millis(10)))
            .into_listener();

        let result = listener.invoke(&Delivery::new("q", 1, "x"), &channel).await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_rejects_without_requeue() {
        let (_broker, channel) = channel().await;
        let calls = Arc::new(AtomicU32::new(0));
        let listener = RetryingListener::new(flaky(u32::MAX, calls.clone()))
            .with_max_attempts(2)
            .with_back_off(BackOffPolicy::fixed_unlimited(Duration::from_millis(10)))
            .into_listener();

        let error = listener
            .invoke(&Delivery::new("q", 1, "x"), &channel)
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(error.requeue_override(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_recoverer_can_accept() {
        struct Accept;

        #[async_trait]
        impl MessageRecoverer for Accept {
            async fn recover(&self, _delivery: &Delivery, _error: ListenerError) -> Result<(), ListenerError> {
                Ok(())
            }
        }

        let (_broker, channel) = channel().await;
        let calls = Arc::new(AtomicU32::new(0));
        let listener = RetryingListener::new(flaky(u32::MAX, calls))
            .with_max_attempts(1)
            .with_recoverer(Accept)
            .into_listener();

        assert!(listener.invoke(&Delivery::new("q", 1, "x"), &channel).await.is_ok());
    }
}
