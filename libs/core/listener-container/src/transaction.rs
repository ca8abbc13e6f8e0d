//! External transaction integration
//!
//! When a [`TransactionManager`] is configured, each delivery is processed
//! inside an external transaction and its channel disposition is deferred to
//! that transaction's completion. The external outcome is authoritative: the
//! delivery is acked only if the external transaction commits.

use crate::channel::ListenerChannel;
use crate::client::Channel;
use crate::error::ClientError;
use crate::sync::MutexExt;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use strum::Display;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Failed to begin transaction: {0}")]
    Begin(String),

    #[error("Transaction commit failed: {0}")]
    Commit(String),

    #[error("Transaction rollback failed: {0}")]
    Rollback(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

/// Starts external transactions
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn ExternalTransaction>, TransactionError>;
}

/// An open external transaction.
///
/// Implementations must invoke every registered synchronization exactly once
/// from `commit` or `rollback`, with the outcome that actually happened.
#[async_trait]
pub trait ExternalTransaction: Send {
    fn register_synchronization(&mut self, synchronization: Box<dyn TransactionSynchronization>);

    async fn commit(&mut self) -> Result<(), TransactionError>;

    async fn rollback(&mut self) -> Result<(), TransactionError>;
}

/// Callback run when an external transaction completes
#[async_trait]
pub trait TransactionSynchronization: Send + Sync {
    async fn after_completion(&self, outcome: TransactionOutcome);
}

/// Whether a completion callback ran, and the first channel error it raised
#[derive(Clone, Default)]
pub(crate) struct CompletionStatus {
    inner: Arc<Mutex<Completion>>,
}

#[derive(Default)]
struct Completion {
    ran: bool,
    error: Option<ClientError>,
}

impl CompletionStatus {
    fn complete(&self, result: Result<(), ClientError>) {
        let mut completion = self.inner.guard();
        completion.ran = true;
        if let Err(error) = result {
            completion.error.get_or_insert(error);
        }
    }

    pub(crate) fn completed(&self) -> bool {
        self.inner.guard().ran
    }

    pub(crate) fn take_error(&self) -> Option<ClientError> {
        self.inner.guard().error.take()
    }
}

/// Applies the channel disposition of one delivery when the external
/// transaction completes
pub(crate) struct ChannelSynchronization {
    channel: Arc<ListenerChannel>,
    delivery_tag: u64,
    channel_transacted: bool,
    requeue_on_rollback: bool,
    status: CompletionStatus,
}

impl ChannelSynchronization {
    pub(crate) fn new(
        channel: Arc<ListenerChannel>,
        delivery_tag: u64,
        channel_transacted: bool,
        requeue_on_rollback: bool,
    ) -> Self {
        Self {
            channel,
            delivery_tag,
            channel_transacted,
            requeue_on_rollback,
            status: CompletionStatus::default(),
        }
    }

    pub(crate) fn status(&self) -> CompletionStatus {
        self.status.clone()
    }

    async fn acknowledge(&self) -> Result<(), ClientError> {
        self.channel.basic_ack(self.delivery_tag, false).await?;
        if self.channel_transacted {
            self.channel.tx_commit().await?;
        }
        Ok(())
    }

    async fn reject(&self) -> Result<(), ClientError> {
        if self.channel_transacted {
            self.channel.tx_rollback().await?;
        }
        self.channel
            .basic_nack(self.delivery_tag, false, self.requeue_on_rollback)
            .await?;
        if self.channel_transacted {
            self.channel.tx_commit().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionSynchronization for ChannelSynchronization {
    async fn after_completion(&self, outcome: TransactionOutcome) {
        debug!(delivery_tag = self.delivery_tag, %outcome, "External transaction completed");
        let result = match outcome {
            TransactionOutcome::Committed => self.acknowledge().await,
            TransactionOutcome::RolledBack => self.reject().await,
        };
        if let Err(error) = &result {
            warn!(
                delivery_tag = self.delivery_tag,
                error = %error,
                "Channel operation failed after external transaction completed"
            );
        }
        self.status.complete(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Connection, ConnectionFactory};
    use crate::testing::{ChannelOp, InMemoryBroker};

    async fn setup(broker: &InMemoryBroker, transactional: bool) -> (Arc<ListenerChannel>, u64) {
        broker.declare_queue("orders");
        broker.publish("orders", "payload").unwrap();
        let connection = broker.create_connection().await.unwrap();
        let channel = connection.create_channel(transactional).await.unwrap();
        let delivery = channel.basic_get("orders", false).await.unwrap().unwrap();
        (Arc::new(ListenerChannel::new(channel)), delivery.delivery_tag)
    }

    #[tokio::test]
    async fn test_commit_acks_delivery() {
        let broker = InMemoryBroker::new();
        let (channel, tag) = setup(&broker, true).await;

        let sync = ChannelSynchronization::new(channel, tag, true, true);
        assert!(!sync.status().completed());
        sync.after_completion(TransactionOutcome::Committed).await;

        assert!(sync.status().completed());
        assert!(sync.status().take_error().is_none());
        assert_eq!(broker.unacked_count(), 0);
        let ops = broker.journal();
        assert!(ops.iter().any(|op| matches!(op, ChannelOp::Ack { delivery_tag, .. } if *delivery_tag == tag)));
        assert!(ops.iter().any(|op| matches!(op, ChannelOp::Commit { .. })));
    }

    #[tokio::test]
    async fn test_rollback_nacks_delivery() {
        let broker = InMemoryBroker::new();
        let (channel, tag) = setup(&broker, false).await;

        let sync = ChannelSynchronization::new(channel, tag, false, true);
        sync.after_completion(TransactionOutcome::RolledBack).await;

        assert_eq!(broker.message_count("orders"), 1);
        assert!(broker
            .journal()
            .iter()
            .any(|op| matches!(op, ChannelOp::Nack { requeue: true, .. })));
    }

    #[tokio::test]
    async fn test_channel_errors_are_recorded() {
        let broker = InMemoryBroker::new();
        let (channel, tag) = setup(&broker, false).await;
        channel.close_physically().await.unwrap();

        let sync = ChannelSynchronization::new(channel, tag, false, true);
        sync.after_completion(TransactionOutcome::Committed).await;

        assert!(sync.status().completed());
        assert_eq!(sync.status().take_error(), Some(ClientError::ChannelClosed));
    }
}
