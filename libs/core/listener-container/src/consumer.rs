//! A single consumer: one channel, one queue, one receive loop.
//!
//! Each consumer runs as its own task. It opens a channel on the shared
//! connection, registers with the broker (or polls, in pull mode), hands
//! deliveries to the listener one at a time and applies the acknowledgement
//! policy. Failures are reported to the container monitor, never retried here.

use crate::ack::{self, AckAction, AckContext, ListenerOutcome};
use crate::channel::ListenerChannel;
use crate::client::{
    Channel, Connection, ConnectionFactory, ConsumerTagStrategy, DeliveryCallback, DeliveryMode,
};
use crate::config::ContainerConfig;
use crate::delivery::Delivery;
use crate::error::{ClientError, FailureKind, ListenerError};
use crate::events::{ContainerEvent, EventPublisher};
use crate::listener::{ErrorHandler, Listener, LoggingErrorHandler};
use crate::metrics::{ChannelOperation, DeliveryOutcome, ListenerMetrics};
use crate::scaling::ConsumerSample;
use crate::sync::MutexExt;
use crate::transaction::{ChannelSynchronization, TransactionManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerState {
    Starting,
    Active,
    Cancelling,
    Failed,
    Terminated,
}

/// Point-in-time view of one consumer
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerSnapshot {
    pub queue: String,
    pub consumer_tag: Option<String>,
    pub state: ConsumerState,
    pub started_at: DateTime<Utc>,
    pub deliveries: u64,
    pub idle_streak: u32,
    pub active_streak: u32,
    pub deferred_acks: usize,
}

/// The connection consumers share, created lazily and replaced once closed
pub(crate) struct SharedConnection {
    factory: Arc<dyn ConnectionFactory>,
    current: tokio::sync::Mutex<Option<Arc<dyn Connection>>>,
}

impl SharedConnection {
    pub(crate) fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) async fn get(&self) -> Result<Arc<dyn Connection>, ClientError> {
        let mut current = self.current.lock().await;
        if let Some(connection) = current.as_ref() {
            if connection.is_open() {
                return Ok(connection.clone());
            }
        }
        let connection = self.factory.create_connection().await?;
        debug!("Opened broker connection");
        *current = Some(connection.clone());
        Ok(connection)
    }

    pub(crate) async fn close(&self) {
        let connection = self.current.lock().await.take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Error closing broker connection");
            }
        }
    }
}

/// Everything a consumer needs from its container
pub(crate) struct ConsumerContext {
    pub(crate) config: ContainerConfig,
    pub(crate) listener: Listener,
    pub(crate) connections: SharedConnection,
    pub(crate) events: EventPublisher,
    pub(crate) transaction_manager: Option<Arc<dyn TransactionManager>>,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
    pub(crate) tag_strategy: Option<ConsumerTagStrategy>,
}

impl ConsumerContext {
    pub(crate) fn new(
        config: ContainerConfig,
        listener: Listener,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            config,
            listener,
            connections: SharedConnection::new(factory),
            events: EventPublisher::default(),
            transaction_manager: None,
            error_handler: Arc::new(LoggingErrorHandler),
            tag_strategy: None,
        }
    }
}

/// Messages from consumer tasks to the container monitor
#[derive(Debug)]
pub(crate) enum ConsumerReport {
    ConsumeOk {
        id: u64,
        queue: String,
    },
    Failed {
        id: u64,
        queue: String,
        error: ClientError,
    },
    Terminated {
        id: u64,
        queue: String,
    },
}

/// State shared between a consumer task and the container registry
pub(crate) struct ConsumerShared {
    queue: String,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    state: Mutex<ConsumerState>,
    consumer_tag: Mutex<Option<String>>,
    channel: Mutex<Option<Arc<ListenerChannel>>>,
    idle_streak: AtomicU32,
    active_streak: AtomicU32,
    deferred_acks: AtomicUsize,
    deliveries: AtomicU64,
}

impl ConsumerShared {
    pub(crate) fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            started_at: Instant::now(),
            started_wall: Utc::now(),
            state: Mutex::new(ConsumerState::Starting),
            consumer_tag: Mutex::new(None),
            channel: Mutex::new(None),
            idle_streak: AtomicU32::new(0),
            active_streak: AtomicU32::new(0),
            deferred_acks: AtomicUsize::new(0),
            deliveries: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConsumerState {
        *self.state.guard()
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.guard() = state;
    }

    pub(crate) fn consumer_tag(&self) -> Option<String> {
        self.consumer_tag.guard().clone()
    }

    fn record_idle(&self) {
        self.active_streak.store(0, Ordering::Relaxed);
        self.idle_streak.fetch_add(1, Ordering::Relaxed);
    }

    fn record_delivery(&self) {
        self.idle_streak.store(0, Ordering::Relaxed);
        self.active_streak.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    fn take_channel(&self) -> Option<Arc<ListenerChannel>> {
        self.channel.guard().take()
    }

    /// Close the channel without waiting for the consumer task
    pub(crate) async fn force_close(&self) {
        if let Some(channel) = self.take_channel() {
            if let Err(e) = channel.close_physically().await {
                debug!(queue = %self.queue, error = %e, "Error force-closing consumer channel");
            }
        }
        self.set_state(ConsumerState::Terminated);
    }

    pub(crate) fn sample(&self, id: u64) -> ConsumerSample {
        ConsumerSample {
            id,
            started_at: self.started_at,
            idle_streak: self.idle_streak.load(Ordering::Relaxed),
            active_streak: self.active_streak.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            queue: self.queue.clone(),
            consumer_tag: self.consumer_tag(),
            state: self.state(),
            started_at: self.started_wall,
            deliveries: self.deliveries.load(Ordering::Relaxed),
            idle_streak: self.idle_streak.load(Ordering::Relaxed),
            active_streak: self.active_streak.load(Ordering::Relaxed),
            deferred_acks: self.deferred_acks.load(Ordering::Relaxed),
        }
    }
}

/// Registry entry for a running consumer
pub(crate) struct ConsumerHandle {
    pub(crate) id: u64,
    pub(crate) shared: Arc<ConsumerShared>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    events: EventPublisher,
}

impl ConsumerHandle {
    /// Ask the consumer to stop after its current delivery
    pub(crate) fn request_stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Stop and wait up to `timeout`; returns false if the channel had to be force-closed
    pub(crate) async fn stop(mut self, timeout: Duration) -> bool {
        self.request_stop();
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    queue = %self.shared.queue,
                    consumer_tag = ?self.shared.consumer_tag(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Consumer did not stop in time; force-closing its channel"
                );
                self.task.abort();
                let already_terminated = self.shared.state() == ConsumerState::Terminated;
                self.shared.force_close().await;
                if !already_terminated {
                    self.events.publish(ContainerEvent::ConsumerTerminated {
                        queue: self.shared.queue.clone(),
                        consumer_tag: self.shared.consumer_tag(),
                    });
                }
                false
            }
        }
    }
}

/// Spawn a consumer task for `queue`
pub(crate) fn spawn(
    id: u64,
    queue: &str,
    ctx: Arc<ConsumerContext>,
    reports: mpsc::UnboundedSender<ConsumerReport>,
) -> ConsumerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let shared = Arc::new(ConsumerShared::new(queue));
    let events = ctx.events.clone();
    let consumer = Consumer {
        id,
        queue: queue.to_string(),
        metrics: ListenerMetrics::new(queue),
        ctx,
        shared: shared.clone(),
        stop: stop_rx,
        reports,
        last_delivery_at: Instant::now(),
        last_delivery_wall: Utc::now(),
        last_idle_event_at: None,
    };
    let task = tokio::spawn(consumer.run());

    ConsumerHandle {
        id,
        shared,
        stop: stop_tx,
        task,
        events,
    }
}

enum Inbound {
    Delivery(Delivery),
    Cancelled,
    Shutdown(ClientError),
}

/// Pushes broker callbacks into the consumer's bounded handoff queue
struct HandoffCallback {
    tx: mpsc::Sender<Inbound>,
}

#[async_trait]
impl DeliveryCallback for HandoffCallback {
    async fn on_delivery(&self, consumer_tag: &str, delivery: Delivery) {
        if self.tx.send(Inbound::Delivery(delivery)).await.is_err() {
            // Left unacknowledged; the broker redelivers it when the channel closes
            trace!(consumer_tag, "Consumer gone, delivery not handed off");
        }
    }

    async fn on_cancel(&self, consumer_tag: &str) {
        debug!(consumer_tag, "Broker cancelled consumer");
        let _ = self.tx.send(Inbound::Cancelled).await;
    }

    async fn on_shutdown(&self, cause: ClientError) {
        let _ = self.tx.send(Inbound::Shutdown(cause)).await;
    }
}

enum Next {
    Delivery(Delivery),
    Idle,
    Cancelled,
    Failed(ClientError),
}

enum DeliverySource {
    Push {
        rx: mpsc::Receiver<Inbound>,
    },
    Pull {
        channel: Arc<ListenerChannel>,
        queue: String,
        auto_ack: bool,
        poll_interval: Duration,
    },
}

impl DeliverySource {
    async fn next(&mut self, timeout: Duration) -> Next {
        match self {
            DeliverySource::Push { rx } => match tokio::time::timeout(timeout, rx.recv()).await {
                Err(_) => Next::Idle,
                Ok(Some(Inbound::Delivery(delivery))) => Next::Delivery(delivery),
                Ok(Some(Inbound::Cancelled)) => Next::Cancelled,
                Ok(Some(Inbound::Shutdown(cause))) => Next::Failed(cause),
                Ok(None) => Next::Failed(ClientError::ChannelClosed),
            },
            DeliverySource::Pull {
                channel,
                queue,
                auto_ack,
                poll_interval,
            } => {
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    match channel.basic_get(queue, *auto_ack).await {
                        Ok(Some(delivery)) => return Next::Delivery(delivery),
                        Ok(None) => {}
                        Err(e) => return Next::Failed(e),
                    }
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Next::Idle;
                    }
                    tokio::time::sleep((*poll_interval).min(deadline - now)).await;
                }
            }
        }
    }

    /// Deliveries handed off but not yet processed
    fn drain(&mut self) -> Vec<Delivery> {
        let DeliverySource::Push { rx } = self else {
            return Vec::new();
        };
        rx.close();
        let mut pending = Vec::new();
        while let Ok(inbound) = rx.try_recv() {
            if let Inbound::Delivery(delivery) = inbound {
                pending.push(delivery);
            }
        }
        pending
    }

    fn is_push(&self) -> bool {
        matches!(self, DeliverySource::Push { .. })
    }
}

/// Per-channel state of a running consumer
struct Session {
    channel: Arc<ListenerChannel>,
    source: DeliverySource,
    connection: Weak<dyn Connection>,
    consumer_tag: String,
    deferred: usize,
    last_deferred_tag: Option<u64>,
}

impl Session {
    fn reset_batch(&mut self) {
        self.deferred = 0;
        self.last_deferred_tag = None;
    }

    /// A channel error on a dead connection is a connection failure
    fn classify(&self, error: ClientError) -> ClientError {
        if error.kind() != FailureKind::Channel {
            return error;
        }
        match self.connection.upgrade() {
            Some(connection) if connection.is_open() => error,
            _ => ClientError::Connection(format!("connection lost: {error}")),
        }
    }
}

struct Consumer {
    id: u64,
    queue: String,
    metrics: ListenerMetrics,
    ctx: Arc<ConsumerContext>,
    shared: Arc<ConsumerShared>,
    stop: watch::Receiver<bool>,
    reports: mpsc::UnboundedSender<ConsumerReport>,
    last_delivery_at: Instant,
    last_delivery_wall: DateTime<Utc>,
    last_idle_event_at: Option<Instant>,
}

impl Consumer {
    async fn run(mut self) {
        let result = self.consume().await;

        if let Some(channel) = self.shared.take_channel() {
            if let Err(e) = channel.close_physically().await {
                debug!(queue = %self.queue, error = %e, "Error closing channel of stopped consumer");
            }
        }
        let consumer_tag = self.shared.consumer_tag();

        match result {
            Err(error) if !self.stop_requested() => {
                self.shared.set_state(ConsumerState::Failed);
                self.metrics.consumer_failed(error.kind());
                warn!(
                    queue = %self.queue,
                    consumer_tag = ?consumer_tag,
                    kind = %error.kind(),
                    error = %error,
                    "Consumer failed"
                );
                self.ctx.events.publish(ContainerEvent::ConsumerFailed {
                    queue: self.queue.clone(),
                    consumer_tag,
                    kind: error.kind(),
                    reason: error.to_string(),
                });
                let _ = self.reports.send(ConsumerReport::Failed {
                    id: self.id,
                    queue: self.queue.clone(),
                    error,
                });
            }
            result => {
                if let Err(error) = result {
                    debug!(queue = %self.queue, error = %error, "Consumer error during shutdown suppressed");
                }
                self.shared.set_state(ConsumerState::Terminated);
                info!(queue = %self.queue, consumer_tag = ?consumer_tag, "Consumer terminated");
                self.ctx.events.publish(ContainerEvent::ConsumerTerminated {
                    queue: self.queue.clone(),
                    consumer_tag,
                });
                let _ = self.reports.send(ConsumerReport::Terminated {
                    id: self.id,
                    queue: self.queue.clone(),
                });
            }
        }
    }

    async fn consume(&mut self) -> Result<(), ClientError> {
        let mut session = self.open_session().await?;
        match self.receive(&mut session).await {
            Ok(()) => self.close_session(&mut session).await,
            Err(error) => Err(session.classify(error)),
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    async fn open_session(&mut self) -> Result<Session, ClientError> {
        let config = &self.ctx.config;
        let connection = self.ctx.connections.get().await?;
        let channel = Arc::new(ListenerChannel::new(
            connection.create_channel(config.channel_transacted).await?,
        ));
        *self.shared.channel.guard() = Some(channel.clone());

        channel.basic_qos(config.prefetch_count).await?;

        let requested_tag = self
            .ctx
            .tag_strategy
            .as_ref()
            .map(|strategy| strategy(&self.queue))
            .unwrap_or_default();
        let auto_ack = config.ack_mode.is_auto_ack();

        let (consumer_tag, source) = match config.delivery_mode {
            DeliveryMode::Push => {
                let (tx, rx) = mpsc::channel(usize::from(config.prefetch_count.max(1)));
                let tag = channel
                    .basic_consume(&self.queue, &requested_tag, auto_ack, Arc::new(HandoffCallback { tx }))
                    .await?;
                (tag, DeliverySource::Push { rx })
            }
            DeliveryMode::Pull { poll_interval } => {
                let tag = if requested_tag.is_empty() {
                    format!("{}-{}", self.queue, Uuid::new_v4().simple())
                } else {
                    requested_tag
                };
                let source = DeliverySource::Pull {
                    channel: channel.clone(),
                    queue: self.queue.clone(),
                    auto_ack,
                    poll_interval,
                };
                (tag, source)
            }
        };

        *self.shared.consumer_tag.guard() = Some(consumer_tag.clone());
        self.shared.set_state(ConsumerState::Active);
        info!(
            queue = %self.queue,
            consumer_tag = %consumer_tag,
            channel = channel.channel_number(),
            "Consumer started"
        );
        self.ctx.events.publish(ContainerEvent::ConsumeOk {
            queue: self.queue.clone(),
            consumer_tag: consumer_tag.clone(),
        });
        let _ = self.reports.send(ConsumerReport::ConsumeOk {
            id: self.id,
            queue: self.queue.clone(),
        });

        self.last_delivery_at = Instant::now();
        self.last_delivery_wall = Utc::now();

        Ok(Session {
            channel,
            source,
            connection: Arc::downgrade(&connection),
            consumer_tag,
            deferred: 0,
            last_deferred_tag: None,
        })
    }

    /// Receive until stop is requested; errors end the consumer
    async fn receive(&mut self, session: &mut Session) -> Result<(), ClientError> {
        let cycle = match self.ctx.config.idle_event_interval {
            Some(interval) => self.ctx.config.receive_timeout.min(interval),
            None => self.ctx.config.receive_timeout,
        };

        loop {
            if self.stop_requested() {
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        // Handle dropped: nobody can stop us any more
                        return Ok(());
                    }
                    continue;
                }
                next = session.source.next(cycle) => next,
            };

            match next {
                Next::Idle => self.on_idle(session).await?,
                Next::Delivery(delivery) => {
                    self.shared.record_delivery();
                    self.handle_delivery(session, delivery).await?;
                }
                Next::Cancelled => {
                    return Err(ClientError::Cancelled {
                        consumer_tag: session.consumer_tag.clone(),
                    })
                }
                Next::Failed(error) => return Err(error),
            }
        }
    }

    async fn on_idle(&mut self, session: &mut Session) -> Result<(), ClientError> {
        self.shared.record_idle();
        self.flush_deferred(session).await?;

        let Some(interval) = self.ctx.config.idle_event_interval else {
            return Ok(());
        };
        let now = Instant::now();
        let reference = self
            .last_idle_event_at
            .map_or(self.last_delivery_at, |at| at.max(self.last_delivery_at));
        if now.duration_since(reference) >= interval {
            self.last_idle_event_at = Some(now);
            self.ctx.events.publish(ContainerEvent::Idle {
                queue: self.queue.clone(),
                consumer_tag: session.consumer_tag.clone(),
                idle_since: self.last_delivery_wall,
                idle_for: now.duration_since(self.last_delivery_at),
            });
        }
        Ok(())
    }

    async fn handle_delivery(&mut self, session: &mut Session, delivery: Delivery) -> Result<(), ClientError> {
        let tag = delivery.delivery_tag;
        self.last_delivery_at = Instant::now();
        self.last_delivery_wall = Utc::now();

        if self.stop_requested() {
            return self.reject_while_stopping(session, tag).await;
        }

        if let Some(manager) = self.ctx.transaction_manager.clone() {
            return self
                .handle_in_transaction(session, &delivery, manager.as_ref())
                .await;
        }

        let outcome = self.invoke_listener(session, &delivery).await;
        let action = ack::decide(&self.ack_context(session, outcome, false));
        self.apply(session, action, tag).await
    }

    async fn reject_while_stopping(&self, session: &mut Session, delivery_tag: u64) -> Result<(), ClientError> {
        debug!(
            queue = %self.queue,
            delivery_tag,
            "Rejecting delivery received after stop was requested"
        );
        self.metrics.delivery(DeliveryOutcome::RejectedWhileStopping);
        let action = ack::decide(&self.ack_context(
            session,
            ListenerOutcome::RejectedWhileStopping,
            false,
        ));
        self.apply(session, action, delivery_tag).await
    }

    async fn handle_in_transaction(
        &self,
        session: &mut Session,
        delivery: &Delivery,
        manager: &dyn TransactionManager,
    ) -> Result<(), ClientError> {
        let tag = delivery.delivery_tag;
        let mut transaction = match manager.begin().await {
            Ok(transaction) => transaction,
            Err(error) => {
                warn!(queue = %self.queue, delivery_tag = tag, error = %error, "Could not begin transaction; requeueing delivery");
                let failure = ListenerOutcome::Failure {
                    requeue: true,
                    transport: false,
                };
                let action = ack::decide(&self.ack_context(session, failure, false));
                return self.apply(session, action, tag).await;
            }
        };

        let outcome = self.invoke_listener(session, delivery).await;
        let action = ack::decide(&self.ack_context(session, outcome, true));
        let (commit, requeue) = match action {
            AckAction::RegisterWithTransaction => (true, true),
            AckAction::RollbackTransaction { requeue } => (false, requeue),
            other => return self.apply(session, other, tag).await,
        };

        let synchronization = ChannelSynchronization::new(
            session.channel.clone(),
            tag,
            self.ctx.config.channel_transacted,
            requeue,
        );
        let status = synchronization.status();
        transaction.register_synchronization(Box::new(synchronization));

        let completion = if commit {
            transaction.commit().await
        } else {
            transaction.rollback().await
        };
        if let Err(error) = &completion {
            warn!(queue = %self.queue, delivery_tag = tag, error = %error, "External transaction did not complete cleanly");
        }

        if !status.completed() {
            // The manager never ran the synchronization; a commit that did not
            // complete counts as rolled back.
            let requeue = commit || requeue;
            warn!(queue = %self.queue, delivery_tag = tag, requeue, "Transaction completion not observed; rejecting delivery");
            return self.reject_after_transaction(session, tag, requeue).await;
        }

        match status.take_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn reject_after_transaction(
        &self,
        session: &mut Session,
        tag: u64,
        requeue: bool,
    ) -> Result<(), ClientError> {
        let action = if self.ctx.config.channel_transacted {
            AckAction::RollbackAndNack {
                requeue,
                multiple: false,
            }
        } else {
            AckAction::Nack {
                requeue,
                ack_deferred: false,
            }
        };
        self.apply(session, action, tag).await
    }

    async fn invoke_listener(&self, session: &Session, delivery: &Delivery) -> ListenerOutcome {
        let started = Instant::now();
        let result = self.ctx.listener.invoke(delivery, &session.channel).await;
        self.metrics.listener_duration(started.elapsed());

        match result {
            Ok(()) => {
                self.metrics.delivery(DeliveryOutcome::Success);
                ListenerOutcome::Success
            }
            Err(error) => {
                self.metrics.delivery(DeliveryOutcome::Failed);
                let requeue = error
                    .requeue_override()
                    .unwrap_or(self.ctx.config.default_requeue_rejected);
                let transport = error.is_transport();
                self.handle_listener_error(delivery, &error);
                ListenerOutcome::Failure { requeue, transport }
            }
        }
    }

    fn handle_listener_error(&self, delivery: &Delivery, error: &ListenerError) {
        if self.stop_requested() {
            debug!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                error = %error,
                "Listener failed while stopping"
            );
        } else {
            self.ctx.error_handler.handle_error(delivery, error);
        }
    }

    fn ack_context(&self, session: &Session, outcome: ListenerOutcome, externally_transacted: bool) -> AckContext {
        AckContext {
            mode: self.ctx.config.ack_mode,
            channel_transacted: self.ctx.config.channel_transacted,
            externally_transacted,
            outcome,
            deferred: session.deferred,
            batch_size: self.ctx.config.batch_size,
        }
    }

    async fn apply(&self, session: &mut Session, action: AckAction, tag: u64) -> Result<(), ClientError> {
        trace!(queue = %self.queue, delivery_tag = tag, ?action, "Applying acknowledgement");
        let channel = session.channel.clone();

        match action {
            AckAction::Nothing => {}
            AckAction::Defer => {
                session.deferred += 1;
                session.last_deferred_tag = Some(tag);
            }
            AckAction::Ack { multiple } => {
                channel.basic_ack(tag, multiple).await?;
                self.metrics.channel_operation(ChannelOperation::Ack);
                session.reset_batch();
            }
            AckAction::AckAndCommit { multiple } => {
                channel.basic_ack(tag, multiple).await?;
                channel.tx_commit().await?;
                self.metrics.channel_operation(ChannelOperation::Ack);
                self.metrics.channel_operation(ChannelOperation::Commit);
                session.reset_batch();
            }
            AckAction::Commit => {
                channel.tx_commit().await?;
                self.metrics.channel_operation(ChannelOperation::Commit);
            }
            AckAction::Rollback => {
                channel.tx_rollback().await?;
                self.metrics.channel_operation(ChannelOperation::Rollback);
            }
            AckAction::Nack { requeue, ack_deferred } => {
                if let Some(last) = session.last_deferred_tag.filter(|_| ack_deferred) {
                    channel.basic_ack(last, true).await?;
                    self.metrics.channel_operation(ChannelOperation::Ack);
                }
                channel.basic_nack(tag, false, requeue).await?;
                self.metrics.channel_operation(ChannelOperation::Nack);
                session.reset_batch();
            }
            AckAction::RollbackAndNack { requeue, multiple } => {
                channel.tx_rollback().await?;
                channel.basic_nack(tag, multiple, requeue).await?;
                channel.tx_commit().await?;
                self.metrics.channel_operation(ChannelOperation::Rollback);
                self.metrics.channel_operation(ChannelOperation::Nack);
                session.reset_batch();
            }
            AckAction::RegisterWithTransaction | AckAction::RollbackTransaction { .. } => {
                warn!(queue = %self.queue, delivery_tag = tag, "Transactional acknowledgement outside a transaction ignored");
            }
        }

        self.shared
            .deferred_acks
            .store(session.deferred, Ordering::Relaxed);
        Ok(())
    }

    async fn flush_deferred(&self, session: &mut Session) -> Result<(), ClientError> {
        let Some(last) = session.last_deferred_tag.filter(|_| session.deferred > 0) else {
            return Ok(());
        };
        let action = if self.ctx.config.channel_transacted {
            AckAction::AckAndCommit {
                multiple: session.deferred > 1,
            }
        } else {
            AckAction::Ack {
                multiple: session.deferred > 1,
            }
        };
        debug!(queue = %self.queue, deferred = session.deferred, "Flushing deferred acknowledgements");
        self.apply(session, action, last).await
    }

    async fn close_session(&mut self, session: &mut Session) -> Result<(), ClientError> {
        self.shared.set_state(ConsumerState::Cancelling);
        debug!(queue = %self.queue, consumer_tag = %session.consumer_tag, "Cancelling consumer");

        if session.source.is_push() {
            if let Err(e) = session.channel.basic_cancel(&session.consumer_tag).await {
                debug!(queue = %self.queue, error = %e, "Cancel failed during shutdown");
            }
        }

        self.flush_deferred(session).await?;
        for delivery in session.source.drain() {
            self.reject_while_stopping(session, delivery.delivery_tag).await?;
        }

        if let Some(channel) = self.shared.take_channel() {
            channel.close_physically().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::listener_fn;
    use crate::testing::{ChannelOp, InMemoryBroker};
    use std::sync::atomic::AtomicUsize;

    fn context(broker: &InMemoryBroker, config: ContainerConfig, listener: Listener) -> Arc<ConsumerContext> {
        Arc::new(ConsumerContext::new(config, listener, Arc::new(broker.clone())))
    }

    fn counting(counter: Arc<AtomicUsize>) -> Listener {
        listener_fn(move |_delivery: Delivery| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_consumes_and_acks() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        for i in 0..3 {
            broker.publish("orders", format!("m{i}")).unwrap();
        }
        let counter = Arc::new(AtomicUsize::new(0));
        let config = ContainerConfig::new(["orders"]).with_receive_timeout(Duration::from_millis(20));
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();

        let handle = spawn(1, "orders", context(&broker, config, counting(counter.clone())), reports_tx);

        assert!(matches!(reports_rx.recv().await, Some(ConsumerReport::ConsumeOk { id: 1, .. })));
        eventually(|| counter.load(Ordering::SeqCst) == 3).await;
        assert!(handle.shared.consumer_tag().unwrap().starts_with("amq.ctag-"));

        assert!(handle.stop(Duration::from_secs(1)).await);
        assert!(matches!(reports_rx.recv().await, Some(ConsumerReport::Terminated { id: 1, .. })));
        assert_eq!(broker.message_count("orders"), 0);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(
            broker
                .journal()
                .iter()
                .filter(|op| matches!(op, ChannelOp::Ack { multiple: false, .. }))
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn test_deferred_acks_flushed_when_idle() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        for i in 0..2 {
            broker.publish("orders", format!("m{i}")).unwrap();
        }
        let counter = Arc::new(AtomicUsize::new(0));
        let config = ContainerConfig::new(["orders"])
            .with_batch_size(10)
            .with_receive_timeout(Duration::from_millis(20));
        let (reports_tx, _reports_rx) = mpsc::unbounded_channel();

        let handle = spawn(1, "orders", context(&broker, config, counting(counter.clone())), reports_tx);

        eventually(|| broker.unacked_count() == 0 && counter.load(Ordering::SeqCst) == 2).await;
        assert!(broker
            .journal()
            .iter()
            .any(|op| matches!(op, ChannelOp::Ack { multiple: true, delivery_tag: 2, .. })));
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_missing_queue_reported() {
        let broker = InMemoryBroker::new();
        let config = ContainerConfig::new(["ghost"]);
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();

        let _handle = spawn(7, "ghost", context(&broker, config, counting(Default::default())), reports_tx);

        match reports_rx.recv().await {
            Some(ConsumerReport::Failed { id, error, .. }) => {
                assert_eq!(id, 7);
                assert_eq!(error.kind(), FailureKind::MissingQueue);
            }
            other => panic!("expected failure report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_loss_classified_as_connection_failure() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        let config = ContainerConfig::new(["orders"]).with_receive_timeout(Duration::from_millis(20));
        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();

        let handle = spawn(1, "orders", context(&broker, config, counting(Default::default())), reports_tx);
        assert!(matches!(reports_rx.recv().await, Some(ConsumerReport::ConsumeOk { .. })));

        broker.drop_connections();

        match reports_rx.recv().await {
            Some(ConsumerReport::Failed { error, .. }) => {
                assert_eq!(error.kind(), FailureKind::Connection)
            }
            other => panic!("expected failure report, got {other:?}"),
        }
        assert_eq!(handle.shared.state(), ConsumerState::Failed);
    }

    #[tokio::test]
    async fn test_pull_mode() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        broker.publish("orders", "polled").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let config = ContainerConfig::new(["orders"])
            .with_delivery_mode(DeliveryMode::Pull {
                poll_interval: Duration::from_millis(5),
            })
            .with_receive_timeout(Duration::from_millis(20));
        let (reports_tx, _reports_rx) = mpsc::unbounded_channel();

        let handle = spawn(1, "orders", context(&broker, config, counting(counter.clone())), reports_tx);

        eventually(|| counter.load(Ordering::SeqCst) == 1 && broker.unacked_count() == 0).await;
        assert!(handle.shared.consumer_tag().unwrap().starts_with("orders-"));
        assert_eq!(broker.consumer_count("orders"), 0);
        handle.stop(Duration::from_secs(1)).await;
    }
}
