//! In-memory broker for tests and demos
//!
//! [`InMemoryBroker`] implements the client traits with the broker behaviour
//! the container relies on: round-robin push dispatch bounded by prefetch,
//! per-channel delivery tags, cumulative acks, transactional
//! acknowledgement, requeue of unacknowledged messages when a channel closes
//! and consumer cancellation when a queue is deleted. Every consume, ack,
//! nack, cancel, commit, rollback and close is journaled as a [`ChannelOp`].
//!
//! Failures can be injected: refused connections, rejected credentials,
//! dropped connections and deleted queues.

use crate::client::{Channel, Connection, ConnectionFactory, DeliveryCallback, QueueDeclarer};
use crate::delivery::{Delivery, MessageProperties};
use crate::error::ClientError;
use crate::sync::MutexExt;
use crate::transaction::{
    ExternalTransaction, TransactionError, TransactionManager, TransactionOutcome,
    TransactionSynchronization,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

/// A recorded channel call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOp {
    Consume {
        channel: u64,
        queue: String,
        consumer_tag: String,
    },
    Ack {
        channel: u64,
        delivery_tag: u64,
        multiple: bool,
    },
    Nack {
        channel: u64,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    Cancel {
        channel: u64,
        consumer_tag: String,
    },
    Commit {
        channel: u64,
    },
    Rollback {
        channel: u64,
    },
    Close {
        channel: u64,
    },
}

/// A message rejected without requeue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Default)]
struct QueueRecord {
    ready: VecDeque<Message>,
    consumers: Vec<String>,
    cursor: usize,
}

struct Unacked {
    queue: String,
    message: Message,
}

struct PendingAck {
    delivery_tag: u64,
    multiple: bool,
    /// `None` acks, `Some(requeue)` nacks
    requeue: Option<bool>,
}

struct ChannelRecord {
    connection_id: u64,
    open: bool,
    transactional: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    pending: Vec<PendingAck>,
}

enum Outbound {
    Deliver(Delivery),
    Cancel,
    Shutdown(ClientError),
}

struct ConsumerRecord {
    queue: String,
    channel_id: u64,
    auto_ack: bool,
    outbound: mpsc::UnboundedSender<Outbound>,
}

struct ConnectionRecord {
    open: bool,
    next_channel_number: u16,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueRecord>,
    connections: HashMap<u64, ConnectionRecord>,
    channels: HashMap<u64, ChannelRecord>,
    consumers: HashMap<String, ConsumerRecord>,
    journal: Vec<ChannelOp>,
    dead_letters: Vec<DeadLetter>,
    connection_attempts: Vec<Instant>,
    refuse_connections: bool,
    reject_credentials: bool,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_channel(&mut self, channel_id: u64) -> Result<&mut ChannelRecord, ClientError> {
        match self.channels.get_mut(&channel_id) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(ClientError::ChannelClosed),
        }
    }

    fn requeue(&mut self, queue: &str, mut message: Message) {
        message.redelivered = true;
        match self.queues.get_mut(queue) {
            Some(record) => record.ready.push_front(message),
            None => self.dead_letters.push(DeadLetter {
                queue: queue.to_string(),
                payload: message.payload,
            }),
        }
    }

    /// Push ready messages to consumers with spare prefetch, round robin
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(record) = self.queues.get_mut(queue) else {
                return;
            };
            if record.ready.is_empty() || record.consumers.is_empty() {
                return;
            }

            let count = record.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let index = (record.cursor + offset) % count;
                let tag = &record.consumers[index];
                let Some(consumer) = self.consumers.get(tag) else {
                    continue;
                };
                let Some(channel) = self.channels.get(&consumer.channel_id) else {
                    continue;
                };
                let has_capacity = consumer.auto_ack
                    || channel.prefetch == 0
                    || channel.unacked.len() < usize::from(channel.prefetch);
                if channel.open && has_capacity {
                    chosen = Some((index, tag.clone()));
                    break;
                }
            }
            let Some((index, tag)) = chosen else {
                return;
            };
            record.cursor = (index + 1) % count;
            let Some(message) = record.ready.pop_front() else {
                return;
            };

            let Some(consumer) = self.consumers.get(&tag) else {
                return;
            };
            let Some(channel) = self.channels.get_mut(&consumer.channel_id) else {
                return;
            };
            channel.next_tag += 1;
            let delivery = Delivery::new(queue, channel.next_tag, message.payload.clone())
                .with_consumer_tag(tag.clone())
                .with_redelivered(message.redelivered)
                .with_properties(message.properties.clone());
            if !consumer.auto_ack {
                channel.unacked.insert(
                    channel.next_tag,
                    Unacked {
                        queue: queue.to_string(),
                        message,
                    },
                );
            }
            trace!(queue, consumer_tag = %tag, delivery_tag = delivery.delivery_tag, "Dispatching");
            let _ = consumer.outbound.send(Outbound::Deliver(delivery));
        }
    }

    fn dispatch_all(&mut self) {
        let queues: Vec<String> = self.queues.keys().cloned().collect();
        for queue in queues {
            self.dispatch(&queue);
        }
    }

    fn close_channel(&mut self, channel_id: u64, cause: Option<ClientError>) {
        let unacked = match self.channels.get_mut(&channel_id) {
            Some(channel) if channel.open => {
                channel.open = false;
                channel.pending.clear();
                std::mem::take(&mut channel.unacked)
            }
            _ => return,
        };

        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.channel_id == channel_id)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in tags {
            let Some(consumer) = self.consumers.remove(&tag) else {
                continue;
            };
            if let Some(cause) = &cause {
                let _ = consumer.outbound.send(Outbound::Shutdown(cause.clone()));
            }
            if let Some(record) = self.queues.get_mut(&consumer.queue) {
                record.consumers.retain(|candidate| candidate != &tag);
            }
        }

        for (_, entry) in unacked.into_iter().rev() {
            self.requeue(&entry.queue, entry.message);
        }
        self.journal.push(ChannelOp::Close {
            channel: channel_id,
        });
        self.dispatch_all();
    }

    fn settle(&mut self, channel_id: u64, delivery_tag: u64, multiple: bool, requeue: Option<bool>) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        let tags: Vec<u64> = if multiple {
            channel.unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
        } else {
            vec![delivery_tag]
        };
        let settled: Vec<Unacked> = tags
            .iter()
            .filter_map(|tag| channel.unacked.remove(tag))
            .collect();

        match requeue {
            None => {}
            Some(true) => {
                for entry in settled.into_iter().rev() {
                    self.requeue(&entry.queue, entry.message);
                }
            }
            Some(false) => {
                self.dead_letters
                    .extend(settled.into_iter().map(|entry| DeadLetter {
                        queue: entry.queue,
                        payload: entry.message.payload,
                    }));
            }
        }
    }

    fn acknowledge(
        &mut self,
        channel_id: u64,
        delivery_tag: u64,
        multiple: bool,
        requeue: Option<bool>,
    ) -> Result<(), ClientError> {
        let channel = self.open_channel(channel_id)?;
        let known = if multiple {
            channel.unacked.range(..=delivery_tag).next().is_some()
        } else {
            channel.unacked.contains_key(&delivery_tag)
        };
        if !known {
            self.close_channel(channel_id, None);
            return Err(ClientError::Channel(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        }

        self.journal.push(match requeue {
            None => ChannelOp::Ack {
                channel: channel_id,
                delivery_tag,
                multiple,
            },
            Some(requeue) => ChannelOp::Nack {
                channel: channel_id,
                delivery_tag,
                multiple,
                requeue,
            },
        });

        let channel = self.open_channel(channel_id)?;
        if channel.transactional {
            channel.pending.push(PendingAck {
                delivery_tag,
                multiple,
                requeue,
            });
            return Ok(());
        }
        self.settle(channel_id, delivery_tag, multiple, requeue);
        self.dispatch_all();
        Ok(())
    }

    fn transactional_channel(&mut self, channel_id: u64) -> Result<&mut ChannelRecord, ClientError> {
        let channel = self.open_channel(channel_id)?;
        if !channel.transactional {
            return Err(ClientError::Channel(
                "PRECONDITION_FAILED - channel is not transactional".into(),
            ));
        }
        Ok(channel)
    }

    fn commit(&mut self, channel_id: u64) -> Result<(), ClientError> {
        let pending = std::mem::take(&mut self.transactional_channel(channel_id)?.pending);
        self.journal.push(ChannelOp::Commit {
            channel: channel_id,
        });
        for ack in pending {
            self.settle(channel_id, ack.delivery_tag, ack.multiple, ack.requeue);
        }
        self.dispatch_all();
        Ok(())
    }

    fn rollback(&mut self, channel_id: u64) -> Result<(), ClientError> {
        self.transactional_channel(channel_id)?.pending.clear();
        self.journal.push(ChannelOp::Rollback {
            channel: channel_id,
        });
        Ok(())
    }

    fn close_connection(&mut self, connection_id: u64, cause: Option<ClientError>) {
        match self.connections.get_mut(&connection_id) {
            Some(connection) if connection.open => connection.open = false,
            _ => return,
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection_id == connection_id && channel.open)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id, cause.clone());
        }
    }
}

/// Shared handle to an in-memory broker; clones see the same queues
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the queue already existed
    pub fn declare_queue(&self, queue: &str) -> bool {
        let mut state = self.state.guard();
        if state.queues.contains_key(queue) {
            return false;
        }
        state.queues.insert(queue.to_string(), QueueRecord::default());
        true
    }

    /// Delete a queue, cancelling its consumers; ready messages are dropped
    pub fn delete_queue(&self, queue: &str) -> bool {
        let mut state = self.state.guard();
        let Some(record) = state.queues.remove(queue) else {
            return false;
        };
        for tag in record.consumers {
            if let Some(consumer) = state.consumers.remove(&tag) {
                let _ = consumer.outbound.send(Outbound::Cancel);
            }
        }
        true
    }

    pub fn publish(&self, queue: &str, payload: impl Into<Vec<u8>>) -> Result<(), ClientError> {
        self.publish_with_properties(queue, payload, MessageProperties::default())
    }

    pub fn publish_with_properties(
        &self,
        queue: &str,
        payload: impl Into<Vec<u8>>,
        properties: MessageProperties,
    ) -> Result<(), ClientError> {
        let mut state = self.state.guard();
        let record = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| ClientError::queue_not_found(queue))?;
        record.ready.push_back(Message {
            payload: payload.into(),
            properties,
            redelivered: false,
        });
        state.dispatch(queue);
        Ok(())
    }

    /// Messages waiting in `queue`, excluding unacknowledged ones
    pub fn message_count(&self, queue: &str) -> usize {
        self.state
            .guard()
            .queues
            .get(queue)
            .map_or(0, |record| record.ready.len())
    }

    /// Delivered but unacknowledged messages across all open channels
    pub fn unacked_count(&self) -> usize {
        self.state
            .guard()
            .channels
            .values()
            .filter(|channel| channel.open)
            .map(|channel| channel.unacked.len())
            .sum()
    }

    /// Push consumers registered on `queue`
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .guard()
            .queues
            .get(queue)
            .map_or(0, |record| record.consumers.len())
    }

    pub fn journal(&self) -> Vec<ChannelOp> {
        self.state.guard().journal.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.guard().dead_letters.clone()
    }

    /// When each `create_connection` call happened, successful or not
    pub fn connection_attempts(&self) -> Vec<Instant> {
        self.state.guard().connection_attempts.clone()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.guard().refuse_connections = refuse;
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.state.guard().reject_credentials = reject;
    }

    /// Close every connection as if the broker went away
    pub fn drop_connections(&self) {
        let mut state = self.state.guard();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, connection)| connection.open)
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            state.close_connection(
                id,
                Some(ClientError::Connection(
                    "CONNECTION_FORCED - broker forced connection closure".into(),
                )),
            );
        }
    }

    pub fn open_connection_count(&self) -> usize {
        self.state
            .guard()
            .connections
            .values()
            .filter(|connection| connection.open)
            .count()
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    async fn create_connection(&self) -> Result<Arc<dyn Connection>, ClientError> {
        let mut state = self.state.guard();
        state.connection_attempts.push(Instant::now());
        if state.refuse_connections {
            return Err(ClientError::Connection("Connection refused".into()));
        }
        if state.reject_credentials {
            return Err(ClientError::Authentication(
                "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN".into(),
            ));
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionRecord {
                open: true,
                next_channel_number: 0,
            },
        );
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            id,
        }))
    }
}

#[async_trait]
impl QueueDeclarer for InMemoryBroker {
    /// Passive declaration: reports whether the queue exists
    async fn declare_queue(&self, queue: &str) -> Result<bool, ClientError> {
        Ok(self.state.guard().queues.contains_key(queue))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.state
            .guard()
            .connections
            .get(&self.id)
            .is_some_and(|connection| connection.open)
    }

    async fn create_channel(&self, transactional: bool) -> Result<Arc<dyn Channel>, ClientError> {
        let mut state = self.state.guard();
        let number = match state.connections.get_mut(&self.id) {
            Some(connection) if connection.open => {
                connection.next_channel_number += 1;
                connection.next_channel_number
            }
            _ => return Err(ClientError::Connection("connection is closed".into())),
        };

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelRecord {
                connection_id: self.id,
                open: true,
                transactional,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                pending: Vec::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            id,
            number,
            transactional,
        }))
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.state.guard().close_connection(self.id, None);
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
    number: u16,
    transactional: bool,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn channel_number(&self) -> u16 {
        self.number
    }

    fn is_open(&self) -> bool {
        self.state
            .guard()
            .channels
            .get(&self.id)
            .is_some_and(|channel| channel.open)
    }

    fn is_transactional(&self) -> bool {
        self.transactional
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), ClientError> {
        let mut state = self.state.guard();
        state.open_channel(self.id)?.prefetch = prefetch_count;
        state.dispatch_all();
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<String, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tag = {
            let mut state = self.state.guard();
            state.open_channel(self.id)?;
            if !state.queues.contains_key(queue) {
                state.close_channel(self.id, None);
                return Err(ClientError::queue_not_found(queue));
            }

            let tag = if consumer_tag.is_empty() {
                format!("amq.ctag-{}", Uuid::new_v4().simple())
            } else {
                consumer_tag.to_string()
            };
            if state.consumers.contains_key(&tag) {
                state.close_channel(self.id, None);
                return Err(ClientError::Channel(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"
                )));
            }

            state.consumers.insert(
                tag.clone(),
                ConsumerRecord {
                    queue: queue.to_string(),
                    channel_id: self.id,
                    auto_ack,
                    outbound: tx,
                },
            );
            if let Some(record) = state.queues.get_mut(queue) {
                record.consumers.push(tag.clone());
            }
            state.journal.push(ChannelOp::Consume {
                channel: self.id,
                queue: queue.to_string(),
                consumer_tag: tag.clone(),
            });
            state.dispatch(queue);
            tag
        };

        forward(tag.clone(), callback, rx);
        Ok(tag)
    }

    async fn basic_get(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>, ClientError> {
        let mut state = self.state.guard();
        state.open_channel(self.id)?;
        let Some(record) = state.queues.get_mut(queue) else {
            state.close_channel(self.id, None);
            return Err(ClientError::queue_not_found(queue));
        };
        let Some(message) = record.ready.pop_front() else {
            return Ok(None);
        };

        let channel = state.open_channel(self.id)?;
        channel.next_tag += 1;
        let delivery = Delivery::new(queue, channel.next_tag, message.payload.clone())
            .with_redelivered(message.redelivered)
            .with_properties(message.properties.clone());
        if !auto_ack {
            channel.unacked.insert(
                channel.next_tag,
                Unacked {
                    queue: queue.to_string(),
                    message,
                },
            );
        }
        Ok(Some(delivery))
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), ClientError> {
        self.state
            .guard()
            .acknowledge(self.id, delivery_tag, multiple, None)
    }

    async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), ClientError> {
        self.state
            .guard()
            .acknowledge(self.id, delivery_tag, multiple, Some(requeue))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), ClientError> {
        let mut state = self.state.guard();
        state.open_channel(self.id)?;
        let owned = state
            .consumers
            .get(consumer_tag)
            .is_some_and(|consumer| consumer.channel_id == self.id);
        if owned {
            if let Some(consumer) = state.consumers.remove(consumer_tag) {
                if let Some(record) = state.queues.get_mut(&consumer.queue) {
                    record.consumers.retain(|tag| tag != consumer_tag);
                }
            }
        }
        state.journal.push(ChannelOp::Cancel {
            channel: self.id,
            consumer_tag: consumer_tag.to_string(),
        });
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), ClientError> {
        let mut state = self.state.guard();
        state.open_channel(self.id)?;
        // Only the default exchange routes; anything else is unroutable and dropped
        if exchange.is_empty() {
            if let Some(record) = state.queues.get_mut(routing_key) {
                record.ready.push_back(Message {
                    payload,
                    properties,
                    redelivered: false,
                });
                state.dispatch(routing_key);
            }
        }
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), ClientError> {
        self.state.guard().commit(self.id)
    }

    async fn tx_rollback(&self) -> Result<(), ClientError> {
        self.state.guard().rollback(self.id)
    }

    async fn confirm_select(&self) -> Result<(), ClientError> {
        self.state.guard().open_channel(self.id)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.state.guard().close_channel(self.id, None);
        Ok(())
    }
}

/// Deliver callbacks for one consumer in order, off the broker lock
fn forward(consumer_tag: String, callback: Arc<dyn DeliveryCallback>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Deliver(delivery) => callback.on_delivery(&consumer_tag, delivery).await,
                Outbound::Cancel => {
                    callback.on_cancel(&consumer_tag).await;
                    break;
                }
                Outbound::Shutdown(cause) => {
                    callback.on_shutdown(cause).await;
                    break;
                }
            }
        }
    });
}

/// One entry in a [`RecordingTransactionManager`] log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRecord {
    Begin,
    Commit,
    Rollback,
    Completed(TransactionOutcome),
}

/// Transaction manager that records what happened, optionally failing commits
#[derive(Clone, Default)]
pub struct RecordingTransactionManager {
    log: Arc<Mutex<Vec<TransactionRecord>>>,
    fail_commits: Arc<AtomicBool>,
}

impl RecordingTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later commit roll back and return an error
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<TransactionRecord> {
        self.log.guard().clone()
    }
}

#[async_trait]
impl TransactionManager for RecordingTransactionManager {
    async fn begin(&self) -> Result<Box<dyn ExternalTransaction>, TransactionError> {
        self.log.guard().push(TransactionRecord::Begin);
        Ok(Box::new(RecordingTransaction {
            log: self.log.clone(),
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
            synchronizations: Vec::new(),
        }))
    }
}

struct RecordingTransaction {
    log: Arc<Mutex<Vec<TransactionRecord>>>,
    fail_commit: bool,
    synchronizations: Vec<Box<dyn TransactionSynchronization>>,
}

impl RecordingTransaction {
    async fn complete(&mut self, outcome: TransactionOutcome) {
        for synchronization in self.synchronizations.drain(..) {
            synchronization.after_completion(outcome).await;
        }
        self.log.guard().push(TransactionRecord::Completed(outcome));
    }
}

#[async_trait]
impl ExternalTransaction for RecordingTransaction {
    fn register_synchronization(&mut self, synchronization: Box<dyn TransactionSynchronization>) {
        self.synchronizations.push(synchronization);
    }

    async fn commit(&mut self) -> Result<(), TransactionError> {
        if self.fail_commit {
            self.log.guard().push(TransactionRecord::Rollback);
            self.complete(TransactionOutcome::RolledBack).await;
            return Err(TransactionError::Commit("simulated commit failure".into()));
        }
        self.log.guard().push(TransactionRecord::Commit);
        self.complete(TransactionOutcome::Committed).await;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TransactionError> {
        self.log.guard().push(TransactionRecord::Rollback);
        self.complete(TransactionOutcome::RolledBack).await;
        Ok(())
    }
}
