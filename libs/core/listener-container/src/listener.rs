//! Message listener traits
//!
//! Implement [`MessageListener`] for plain payload handling, or
//! [`ChannelAwareMessageListener`] when the listener acknowledges or publishes
//! through the consumer's channel itself.
//!
//! # Example
//!
//! ```rust,ignore
//! use listener_container::{Delivery, ListenerError, MessageListener};
//! use async_trait::async_trait;
//!
//! struct OrderListener;
//!
//! #[async_trait]
//! impl MessageListener for OrderListener {
//!     async fn on_message(&self, delivery: &Delivery) -> Result<(), ListenerError> {
//!         let order = parse(&delivery.payload).map_err(|e| ListenerError::reject(e.to_string()))?;
//!         store(order).await.map_err(|e| ListenerError::with_source("store failed", e))
//!     }
//! }
//! ```

use crate::channel::ListenerChannel;
use crate::delivery::Delivery;
use crate::error::ListenerError;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, delivery: &Delivery) -> Result<(), ListenerError>;

    /// Get the listener name for logging.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[async_trait]
pub trait ChannelAwareMessageListener: Send + Sync {
    async fn on_message(
        &self,
        delivery: &Delivery,
        channel: &ListenerChannel,
    ) -> Result<(), ListenerError>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The listener a container invokes
#[derive(Clone)]
pub enum Listener {
    Plain(Arc<dyn MessageListener>),
    ChannelAware(Arc<dyn ChannelAwareMessageListener>),
}

impl Listener {
    pub fn plain(listener: impl MessageListener + 'static) -> Self {
        Listener::Plain(Arc::new(listener))
    }

    pub fn channel_aware(listener: impl ChannelAwareMessageListener + 'static) -> Self {
        Listener::ChannelAware(Arc::new(listener))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Listener::Plain(listener) => listener.name(),
            Listener::ChannelAware(listener) => listener.name(),
        }
    }

    /// Invoke the listener, converting a panic into [`ListenerError::Panicked`]
    pub async fn invoke(
        &self,
        delivery: &Delivery,
        channel: &ListenerChannel,
    ) -> Result<(), ListenerError> {
        let call = async {
            match self {
                Listener::Plain(listener) => listener.on_message(delivery).await,
                Listener::ChannelAware(listener) => listener.on_message(delivery, channel).await,
            }
        };

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ListenerError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Listener backed by an async closure
pub struct FnListener<F> {
    f: F,
}

/// Wrap an async closure taking an owned [`Delivery`] as a listener
pub fn listener_fn<F, Fut>(f: F) -> Listener
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    Listener::plain(FnListener { f })
}

#[async_trait]
impl<F, Fut> MessageListener for FnListener<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ListenerError>> + Send,
{
    async fn on_message(&self, delivery: &Delivery) -> Result<(), ListenerError> {
        (self.f)(delivery.clone()).await
    }

    fn name(&self) -> &'static str {
        "fn_listener"
    }
}

/// Handles listener failures while the container is running
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, delivery: &Delivery, error: &ListenerError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&Delivery, &ListenerError) + Send + Sync,
{
    fn handle_error(&self, delivery: &Delivery, error: &ListenerError) {
        self(delivery, error)
    }
}

/// Logs listener failures; used when no handler is configured
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, delivery: &Delivery, error: &ListenerError) {
        warn!(
            queue = %delivery.queue,
            delivery_tag = delivery.delivery_tag,
            error = %error,
            "Execution of message listener failed, and no error handler has been set"
        );
    }
}

/// Listener that accepts every delivery
pub struct NoOpListener;

#[async_trait]
impl MessageListener for NoOpListener {
    async fn on_message(&self, _delivery: &Delivery) -> Result<(), ListenerError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
