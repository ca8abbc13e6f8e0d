//! The listener container
//!
//! Owns the queue → consumers registry and a single monitor task that
//! drives adaptive scaling and broker recovery. All registry changes happen
//! under one lock that is never held across an `.await`.

use crate::ack::AckMode;
use crate::client::{ConnectionFactory, ConsumerTagStrategy, QueueDeclarer};
use crate::config::ContainerConfig;
use crate::consumer::{self, ConsumerContext, ConsumerHandle, ConsumerReport, ConsumerSnapshot, ConsumerState};
use crate::error::ContainerError;
use crate::events::{ContainerEvent, EventPublisher, EventSink};
use crate::listener::{ErrorHandler, Listener};
use crate::metrics::{self, ListenerMetrics};
use crate::recovery::{QueueState, RecoveryAction, RecoverySupervisor};
use crate::scaling::{ConcurrencyBounds, ConsumerSample, ScalingController, ScalingDecision};
use crate::sync::MutexExt;
use crate::transaction::TransactionManager;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub state: Option<QueueState>,
    pub consumers: Vec<ConsumerSnapshot>,
}

/// Point-in-time view of the whole container
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSnapshot {
    pub state: ContainerState,
    pub min_consumers_per_queue: usize,
    pub max_consumers_per_queue: usize,
    pub queues: Vec<QueueSnapshot>,
}

impl ContainerSnapshot {
    /// Running, with no queue missing or fatally failed
    pub fn is_ready(&self) -> bool {
        self.state == ContainerState::Running
            && self
                .queues
                .iter()
                .all(|queue| queue.state.is_none_or(|state| state.is_consumable()))
    }
}

struct Registry {
    state: ContainerState,
    queues: Vec<String>,
    consumers: HashMap<String, Vec<ConsumerHandle>>,
    bounds: ConcurrencyBounds,
    scaling: ScalingController,
    supervisor: RecoverySupervisor,
    reports: Option<mpsc::UnboundedSender<ConsumerReport>>,
    monitor_stop: Option<watch::Sender<bool>>,
    monitor: Option<JoinHandle<()>>,
    /// Background stops of scaled-down or paused consumers
    retiring: Vec<JoinHandle<bool>>,
}

impl Registry {
    fn remove_consumer(&mut self, queue: &str, id: u64) -> Option<ConsumerHandle> {
        let handles = self.consumers.get_mut(queue)?;
        let index = handles.iter().position(|handle| handle.id == id)?;
        Some(handles.remove(index))
    }

    fn consumer_count(&self, queue: &str) -> usize {
        self.consumers.get(queue).map_or(0, Vec::len)
    }

    fn samples(&self, queue: &str) -> Vec<ConsumerSample> {
        self.consumers
            .get(queue)
            .map(|handles| {
                handles
                    .iter()
                    .map(|handle| handle.shared.sample(handle.id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct ContainerInner {
    ctx: Arc<ConsumerContext>,
    declarer: Option<Arc<dyn QueueDeclarer>>,
    registry: Mutex<Registry>,
    state_tx: watch::Sender<ContainerState>,
    next_id: AtomicU64,
}

/// Runs consumers for a set of queues and keeps them alive
///
/// ```ignore
/// let container = ListenerContainer::builder(factory, listener_fn(handle_order))
///     .with_config(ContainerConfig::new(["orders"]).with_concurrency(1, 4))
///     .build();
/// container.start()?;
/// // ...
/// container.stop().await;
/// ```
pub struct ListenerContainer {
    inner: Arc<ContainerInner>,
}

pub struct ListenerContainerBuilder {
    factory: Arc<dyn ConnectionFactory>,
    listener: Listener,
    config: ContainerConfig,
    event_sink: Option<Arc<dyn EventSink>>,
    declarer: Option<Arc<dyn QueueDeclarer>>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    tag_strategy: Option<ConsumerTagStrategy>,
}

impl ListenerContainerBuilder {
    pub fn with_config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.event_sink = Some(Arc::new(sink));
        self
    }

    /// Used to check for (or re-declare) missing queues
    pub fn with_queue_declarer(mut self, declarer: Arc<dyn QueueDeclarer>) -> Self {
        self.declarer = Some(declarer);
        self
    }

    pub fn with_transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(manager);
        self
    }

    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_consumer_tag_strategy<F>(mut self, strategy: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.tag_strategy = Some(Arc::new(strategy));
        self
    }

    pub fn build(self) -> ListenerContainer {
        let queues = self.config.queue_names.clone();
        let bounds = self.config.bounds();
        let scaling = ScalingController::new((&self.config).into());
        let supervisor = RecoverySupervisor::new((&self.config).into());

        let mut ctx = ConsumerContext::new(self.config, self.listener, self.factory);
        ctx.events = EventPublisher::new(self.event_sink);
        ctx.transaction_manager = self.transaction_manager;
        ctx.tag_strategy = self.tag_strategy;
        if let Some(handler) = self.error_handler {
            ctx.error_handler = handler;
        }

        let (state_tx, _) = watch::channel(ContainerState::Created);
        ListenerContainer {
            inner: Arc::new(ContainerInner {
                ctx: Arc::new(ctx),
                declarer: self.declarer,
                registry: Mutex::new(Registry {
                    state: ContainerState::Created,
                    queues,
                    consumers: HashMap::new(),
                    bounds,
                    scaling,
                    supervisor,
                    reports: None,
                    monitor_stop: None,
                    monitor: None,
                    retiring: Vec::new(),
                }),
                state_tx,
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl ListenerContainer {
    pub fn builder(factory: Arc<dyn ConnectionFactory>, listener: Listener) -> ListenerContainerBuilder {
        ListenerContainerBuilder {
            factory,
            listener,
            config: ContainerConfig::default(),
            event_sink: None,
            declarer: None,
            transaction_manager: None,
            error_handler: None,
            tag_strategy: None,
        }
    }

    /// Validate the configuration and start consumers
    ///
    /// A no-op when already running. A stopped container can be started
    /// again. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), ContainerError> {
        let inner = &self.inner;
        {
            let mut registry = inner.registry.guard();
            match registry.state {
                ContainerState::Running => return Ok(()),
                ContainerState::Stopping => {
                    return Err(ContainerError::IllegalState {
                        state: registry.state,
                        operation: "start",
                    });
                }
                ContainerState::Created | ContainerState::Stopped => {}
            }

            let mut effective = inner.ctx.config.clone();
            effective.queue_names = registry.queues.clone();
            effective.min_consumers_per_queue = registry.bounds.min;
            effective.max_consumers_per_queue = registry.bounds.max;
            effective.validate()?;
            if inner.ctx.transaction_manager.is_some() && effective.ack_mode != AckMode::Auto {
                return Err(ContainerError::config(format!(
                    "an external transaction manager requires ack mode AUTO, not {}",
                    effective.ack_mode
                )));
            }

            let (reports_tx, reports_rx) = mpsc::unbounded_channel();
            let (stop_tx, stop_rx) = watch::channel(false);
            registry.scaling = ScalingController::new((&inner.ctx.config).into());
            registry.supervisor = RecoverySupervisor::new((&inner.ctx.config).into());
            for queue in registry.queues.clone() {
                registry.supervisor.track(&queue);
            }
            registry.reports = Some(reports_tx);
            registry.monitor_stop = Some(stop_tx);
            registry.state = ContainerState::Running;
            registry.monitor = Some(tokio::spawn(monitor(inner.clone(), reports_rx, stop_rx)));
        }
        inner.state_tx.send_replace(ContainerState::Running);

        let (queues, bounds) = {
            let registry = inner.registry.guard();
            (registry.queues.clone(), registry.bounds)
        };
        info!(
            queues = ?queues,
            min_consumers = bounds.min,
            max_consumers = bounds.max,
            ack_mode = %inner.ctx.config.ack_mode,
            listener = inner.ctx.listener.name(),
            "Starting listener container"
        );
        inner.ctx.events.publish(ContainerEvent::ContainerStarted);
        inner.converge(Instant::now());
        Ok(())
    }

    /// Stop all consumers, waiting up to the shutdown timeout for in-flight work
    pub async fn stop(&self) {
        self.inner.shutdown(None).await;

        let monitor = self.inner.registry.guard().monitor.take();
        if let Some(monitor) = monitor {
            if let Err(e) = monitor.await {
                warn!(error = %e, "Container monitor task ended abnormally");
            }
        }

        // Another caller may still be draining consumers
        let mut state = self.inner.state_tx.subscribe();
        let _ = state
            .wait_for(|state| *state != ContainerState::Stopping)
            .await;
    }

    pub fn state(&self) -> ContainerState {
        self.inner.registry.guard().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ContainerState::Running
    }

    /// Wait until the container reaches `target`; false on timeout
    pub async fn wait_for_state(&self, target: ContainerState, timeout: Duration) -> bool {
        let mut state = self.inner.state_tx.subscribe();
        tokio::time::timeout(timeout, state.wait_for(|state| *state == target))
            .await
            .is_ok_and(|result| result.is_ok())
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.inner.registry.guard().queues.clone()
    }

    /// Consumers registered for `queue`, whatever their state
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner.registry.guard().consumer_count(queue)
    }

    /// Consumers across all queues that have registered with the broker
    pub fn active_consumer_count(&self) -> usize {
        self.inner
            .registry
            .guard()
            .consumers
            .values()
            .flatten()
            .filter(|handle| handle.shared.state() == ConsumerState::Active)
            .count()
    }

    pub fn queue_state(&self, queue: &str) -> Option<QueueState> {
        self.inner.registry.guard().supervisor.queue_state(queue)
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        let registry = self.inner.registry.guard();
        let queues = registry
            .queues
            .iter()
            .map(|queue| QueueSnapshot {
                name: queue.clone(),
                state: registry.supervisor.queue_state(queue),
                consumers: registry
                    .consumers
                    .get(queue)
                    .map(|handles| handles.iter().map(|handle| handle.shared.snapshot()).collect())
                    .unwrap_or_default(),
            })
            .collect();

        ContainerSnapshot {
            state: registry.state,
            min_consumers_per_queue: registry.bounds.min,
            max_consumers_per_queue: registry.bounds.max,
            queues,
        }
    }

    /// Add queues; consumers start immediately when running
    pub fn add_queue_names<I, S>(&self, names: I) -> Result<(), ContainerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        {
            let mut registry = self.inner.registry.guard();
            let mut seen: HashSet<&str> = registry.queues.iter().map(String::as_str).collect();
            for name in &names {
                if name.trim().is_empty() {
                    return Err(ContainerError::config("queue names must not be empty"));
                }
                if !seen.insert(name.as_str()) {
                    return Err(ContainerError::DuplicateQueue(name.clone()));
                }
            }

            for name in names {
                info!(queue = %name, "Adding queue");
                if registry.state == ContainerState::Running {
                    registry.supervisor.track(&name);
                }
                registry.queues.push(name);
            }
        }
        self.inner.converge(Instant::now());
        Ok(())
    }

    /// Remove queues, stopping their consumers
    ///
    /// Returns once every removed consumer has finished its in-flight
    /// delivery or the shutdown timeout forced its channel closed.
    /// Unknown names are ignored.
    pub async fn remove_queue_names<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let handles: Vec<ConsumerHandle> = {
            let mut registry = self.inner.registry.guard();
            let mut removed = Vec::new();
            for name in names {
                let name = name.as_ref();
                let Some(index) = registry.queues.iter().position(|queue| queue == name) else {
                    debug!(queue = name, "Ignoring removal of unknown queue");
                    continue;
                };
                info!(queue = name, "Removing queue");
                registry.queues.remove(index);
                registry.supervisor.forget(name);
                registry.scaling.forget(name);
                ListenerMetrics::new(name).consumers(0);
                removed.extend(registry.consumers.remove(name).unwrap_or_default());
            }
            removed
        };

        self.inner.stop_consumers(handles).await;
    }

    /// Pin the consumer count per queue to `count`
    pub fn set_consumers_per_queue(&self, count: usize) -> Result<(), ContainerError> {
        self.set_concurrency(count, count)
    }

    /// Change the per-queue bounds and converge immediately
    pub fn set_concurrency(&self, min: usize, max: usize) -> Result<(), ContainerError> {
        let bounds = ConcurrencyBounds::new(min, max);
        bounds.validate().map_err(ContainerError::Config)?;
        info!(min_consumers = min, max_consumers = max, "Changing consumer concurrency");
        self.inner.registry.guard().bounds = bounds;
        self.inner.converge(Instant::now());
        Ok(())
    }
}

impl Drop for ListenerContainer {
    fn drop(&mut self) {
        let registry = self.inner.registry.guard();
        if let Some(stop) = registry.monitor_stop.as_ref() {
            let _ = stop.send(true);
        }
        for handle in registry.consumers.values().flatten() {
            handle.request_stop();
        }
    }
}

impl ContainerInner {
    fn spawn_consumer(&self, queue: &str, reports: &mpsc::UnboundedSender<ConsumerReport>) -> ConsumerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(queue, consumer_id = id, "Starting consumer");
        consumer::spawn(id, queue, self.ctx.clone(), reports.clone())
    }

    /// Bring every consumable queue within its bounds
    fn converge(&self, now: Instant) {
        let surplus = {
            let mut registry = self.registry.guard();
            self.converge_locked(&mut registry, now)
        };
        self.retire(surplus);
    }

    fn converge_locked(&self, registry: &mut Registry, now: Instant) -> Vec<ConsumerHandle> {
        if registry.state != ContainerState::Running {
            return Vec::new();
        }
        let Some(reports) = registry.reports.clone() else {
            return Vec::new();
        };

        let attempt_due = registry.supervisor.attempt_due(now);
        let blocked = registry.supervisor.restarts_blocked(now);
        let bounds = registry.bounds;
        let mut surplus = Vec::new();
        let mut launched = false;

        for queue in registry.queues.clone() {
            if !registry.supervisor.is_consumable(&queue) {
                continue;
            }
            let handles = registry.consumers.entry(queue.clone()).or_default();

            let excess = bounds.surplus(handles.len());
            if excess > 0 {
                // oldest first
                handles.sort_by_key(|handle| handle.id);
                surplus.extend(handles.drain(..excess));
            }

            if !blocked {
                for _ in 0..bounds.deficit(handles.len()) {
                    handles.push(self.spawn_consumer(&queue, &reports));
                    launched = true;
                }
            }
        }

        if attempt_due {
            if launched {
                registry.supervisor.begin_attempt();
            } else {
                registry.supervisor.abandon_round();
            }
        }
        surplus
    }

    /// Gracefully stop consumers in the background
    fn retire(&self, handles: Vec<ConsumerHandle>) {
        if handles.is_empty() {
            return;
        }
        let timeout = self.ctx.config.shutdown_timeout;
        let mut registry = self.registry.guard();
        registry.retiring.retain(|task| !task.is_finished());
        for handle in handles {
            handle.request_stop();
            registry.retiring.push(tokio::spawn(handle.stop(timeout)));
        }
    }

    async fn stop_consumers(&self, handles: Vec<ConsumerHandle>) -> usize {
        for handle in &handles {
            handle.request_stop();
        }
        let timeout = self.ctx.config.shutdown_timeout;
        let graceful = join_all(handles.into_iter().map(|handle| handle.stop(timeout))).await;
        graceful.iter().filter(|graceful| !**graceful).count()
    }

    /// One monitor tick: adaptive scaling, convergence and due re-declarations
    async fn tick(&self) {
        let now = Instant::now();
        let surplus = {
            let mut registry = self.registry.guard();
            if registry.state != ContainerState::Running {
                return;
            }
            let blocked = registry.supervisor.restarts_blocked(now);
            let bounds = registry.bounds;
            let mut surplus = Vec::new();

            for queue in registry.queues.clone() {
                if registry.supervisor.queue_state(&queue) != Some(QueueState::Declared) {
                    continue;
                }
                let samples = registry.samples(&queue);
                match registry.scaling.evaluate(&queue, bounds, &samples, now) {
                    ScalingDecision::StartOne if !blocked => {
                        if let Some(reports) = registry.reports.clone() {
                            let handle = self.spawn_consumer(&queue, &reports);
                            registry.consumers.entry(queue.clone()).or_default().push(handle);
                            info!(queue = %queue, consumers = samples.len() + 1, "Scaling up");
                        }
                    }
                    ScalingDecision::StopOne { consumer_id } => {
                        if let Some(handle) = registry.remove_consumer(&queue, consumer_id) {
                            info!(queue = %queue, consumers = samples.len() - 1, "Scaling down idle consumer");
                            surplus.push(handle);
                        }
                    }
                    ScalingDecision::StartOne | ScalingDecision::Hold => {}
                }
            }

            surplus.extend(self.converge_locked(&mut registry, now));
            for queue in &registry.queues {
                ListenerMetrics::new(queue.as_str()).consumers(registry.consumer_count(queue));
            }
            surplus
        };

        self.retire(surplus);
        self.redeclare_missing(now).await;
    }

    /// A recovery deadline passed
    async fn recover(&self) {
        let now = Instant::now();
        self.redeclare_missing(now).await;
        self.converge(now);
    }

    async fn redeclare_missing(&self, now: Instant) {
        let due = {
            let mut registry = self.registry.guard();
            if registry.state != ContainerState::Running {
                return;
            }
            registry.supervisor.queues_due_for_declaration(now)
        };
        if due.is_empty() {
            return;
        }

        let mut recovered = Vec::new();
        for queue in due {
            let exists = match &self.declarer {
                Some(declarer) => match declarer.declare_queue(&queue).await {
                    Ok(exists) => exists,
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Queue declaration failed; will retry");
                        false
                    }
                },
                // Without a declarer the next consumer start is the probe
                None => true,
            };
            let resumed = self
                .registry
                .guard()
                .supervisor
                .on_declaration_result(&queue, exists);
            if resumed {
                if self.declarer.is_some() {
                    info!(queue = %queue, "Missing queue is available again");
                    self.ctx.events.publish(ContainerEvent::QueueRecovered {
                        queue: queue.clone(),
                    });
                } else {
                    debug!(queue = %queue, "Probing missing queue with a new consumer");
                }
                recovered.push(queue);
            } else {
                debug!(queue = %queue, "Queue still missing");
            }
        }

        if !recovered.is_empty() {
            self.converge(Instant::now());
        }
    }

    async fn handle_report(&self, report: ConsumerReport) {
        match report {
            ConsumerReport::ConsumeOk { queue, .. } => {
                self.registry.guard().supervisor.on_consume_ok(&queue);
            }
            ConsumerReport::Terminated { id, queue } => {
                self.registry.guard().remove_consumer(&queue, id);
            }
            ConsumerReport::Failed { id, queue, error } => {
                let action = {
                    let mut registry = self.registry.guard();
                    registry.remove_consumer(&queue, id);
                    if registry.state != ContainerState::Running || !registry.queues.contains(&queue) {
                        return;
                    }
                    registry.supervisor.on_failure(&queue, &error, Instant::now())
                };
                self.apply_recovery(action).await;
            }
        }
    }

    async fn apply_recovery(&self, action: RecoveryAction) {
        match action {
            RecoveryAction::Restart { queue } => {
                debug!(queue = %queue, "Consumer will be replaced on the next monitor tick");
            }
            RecoveryAction::PauseQueue { queue } => {
                let handles = self
                    .registry
                    .guard()
                    .consumers
                    .remove(&queue)
                    .unwrap_or_default();
                warn!(
                    queue = %queue,
                    stopped_consumers = handles.len(),
                    "Queue is missing; pausing its consumers"
                );
                self.ctx.events.publish(ContainerEvent::QueueMissing { queue });
                self.retire(handles);
            }
            RecoveryAction::ScheduleRetry { delay, attempt } => {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Broker unavailable; scheduling consumer restart"
                );
            }
            RecoveryAction::AwaitRound => {
                debug!("Failure covered by the pending recovery attempt");
            }
            RecoveryAction::Fatal { reason } => {
                error!(reason = %reason, "Unrecoverable consumer failure; stopping container");
                self.shutdown(Some(reason)).await;
            }
        }
    }

    /// Stop everything; `fatal` carries the reason when recovery gave up
    async fn shutdown(&self, fatal: Option<String>) {
        let (handles, retiring): (Vec<ConsumerHandle>, Vec<JoinHandle<bool>>) = {
            let mut registry = self.registry.guard();
            if registry.state != ContainerState::Running {
                return;
            }
            registry.state = ContainerState::Stopping;
            registry.reports = None;
            if let Some(stop) = registry.monitor_stop.take() {
                let _ = stop.send(true);
            }
            let handles = registry.consumers.drain().flat_map(|(_, handles)| handles).collect();
            (handles, std::mem::take(&mut registry.retiring))
        };
        self.state_tx.send_replace(ContainerState::Stopping);
        info!(
            consumers = handles.len(),
            retiring = retiring.len(),
            fatal = fatal.is_some(),
            "Stopping listener container"
        );

        let (forced, retired) = tokio::join!(self.stop_consumers(handles), join_all(retiring));
        let forced = forced
            + retired
                .iter()
                .filter(|graceful| !matches!(graceful, Ok(true)))
                .count();
        if forced > 0 {
            warn!(forced, "Some consumers were force-closed after the shutdown timeout");
        }

        if self.ctx.config.owns_connection {
            self.ctx.connections.close().await;
        }

        {
            let mut registry = self.registry.guard();
            registry.state = ContainerState::Stopped;
            if fatal.is_some() {
                registry.supervisor.mark_all_fatal();
            }
            for queue in &registry.queues {
                ListenerMetrics::new(queue.as_str()).consumers(0);
            }
        }
        self.state_tx.send_replace(ContainerState::Stopped);

        metrics::container_stopped(fatal.is_some());
        info!(fatal = fatal.is_some(), "Listener container stopped");
        self.ctx.events.publish(ContainerEvent::ContainerStopped {
            fatal: fatal.is_some(),
            reason: fatal,
        });
    }

    fn next_recovery_deadline(&self) -> Option<Instant> {
        self.registry.guard().supervisor.next_deadline()
    }
}

async fn monitor(
    inner: Arc<ContainerInner>,
    mut reports: mpsc::UnboundedReceiver<ConsumerReport>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(inner.ctx.config.monitor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; start() already converged
    ticker.tick().await;

    debug!("Container monitor started");
    loop {
        let deadline = inner.next_recovery_deadline();
        let wake_at = tokio::time::Instant::from_std(deadline.unwrap_or_else(Instant::now));

        tokio::select! {
            biased;
            _ = stop.changed() => break,
            Some(report) = reports.recv() => inner.handle_report(report).await,
            _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => inner.recover().await,
            _ = ticker.tick() => inner.tick().await,
        }

        if *stop.borrow() {
            break;
        }
    }
    debug!("Container monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockQueueDeclarer;
    use crate::listener::{NoOpListener, listener_fn};
    use crate::delivery::Delivery;
    use crate::testing::InMemoryBroker;
    use std::sync::atomic::AtomicUsize;

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn fast_config(queues: &[&str]) -> ContainerConfig {
        ContainerConfig::new(queues.iter().copied())
            .with_receive_timeout(Duration::from_millis(20))
            .with_monitor_interval(Duration::from_millis(50))
            .with_failed_declaration_retry_interval(Duration::from_millis(50))
            .with_shutdown_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        let container = ListenerContainer::builder(Arc::new(broker.clone()), Listener::plain(NoOpListener))
            .with_config(fast_config(&["orders"]).with_consumers_per_queue(2))
            .build();
        assert_eq!(container.state(), ContainerState::Created);

        container.start().unwrap();
        container.start().unwrap();
        assert!(container.is_running());
        assert_eq!(container.consumer_count("orders"), 2);
        eventually(|| container.active_consumer_count() == 2).await;

        container.stop().await;
        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(container.consumer_count("orders"), 0);
        assert_eq!(broker.open_connection_count(), 0);

        container.start().unwrap();
        eventually(|| container.active_consumer_count() == 2).await;
        container.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_configuration_rejected_at_start() {
        let broker = InMemoryBroker::new();
        let container = ListenerContainer::builder(Arc::new(broker), Listener::plain(NoOpListener))
            .with_config(
                ContainerConfig::new(["orders"])
                    .with_ack_mode(AckMode::None)
                    .with_channel_transacted(true),
            )
            .build();

        assert!(matches!(container.start(), Err(ContainerError::Config(_))));
        assert_eq!(container.state(), ContainerState::Created);
    }

    #[tokio::test]
    async fn test_duplicate_queue_rejected() {
        let broker = InMemoryBroker::new();
        let container = ListenerContainer::builder(Arc::new(broker), Listener::plain(NoOpListener))
            .with_config(ContainerConfig::new(["orders"]))
            .build();

        let result = container.add_queue_names(["invoices", "orders"]);
        assert!(matches!(result, Err(ContainerError::DuplicateQueue(name)) if name == "orders"));
        assert_eq!(container.queue_names(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_set_concurrency_converges_immediately() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        let container = ListenerContainer::builder(Arc::new(broker), Listener::plain(NoOpListener))
            .with_config(fast_config(&["orders"]))
            .build();
        container.start().unwrap();

        container.set_consumers_per_queue(3).unwrap();
        assert_eq!(container.consumer_count("orders"), 3);

        container.set_concurrency(1, 1).unwrap();
        assert_eq!(container.consumer_count("orders"), 1);

        assert!(container.set_concurrency(2, 1).is_err());
        container.stop().await;
    }

    #[tokio::test]
    async fn test_missing_queue_recovered_through_declarer() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("orders");
        let declared = Arc::new(AtomicUsize::new(0));

        let mut declarer = MockQueueDeclarer::new();
        {
            let broker = broker.clone();
            let declared = declared.clone();
            declarer.expect_declare_queue().returning(move |name| {
                declared.fetch_add(1, Ordering::SeqCst);
                broker.declare_queue(name);
                Ok(true)
            });
        }

        let processed = Arc::new(AtomicUsize::new(0));
        let listener = {
            let processed = processed.clone();
            listener_fn(move |_delivery: Delivery| {
                let processed = processed.clone();
                async move {
                    processed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = events.clone();
            move |event: ContainerEvent| events.guard().push(event.name())
        };

        let container = ListenerContainer::builder(Arc::new(broker.clone()), listener)
            .with_config(fast_config(&["orders"]))
            .with_queue_declarer(Arc::new(declarer))
            .with_event_sink(sink)
            .build();
        container.start().unwrap();
        eventually(|| container.active_consumer_count() == 1).await;

        broker.delete_queue("orders");
        eventually(|| declared.load(Ordering::SeqCst) > 0).await;
        eventually(|| container.queue_state("orders") == Some(QueueState::Declared)).await;
        eventually(|| container.active_consumer_count() == 1).await;

        broker.publish("orders", "after recovery").unwrap();
        eventually(|| processed.load(Ordering::SeqCst) == 1).await;

        let seen = events.guard().clone();
        assert!(seen.contains(&"queue_missing"));
        assert!(seen.contains(&"queue_recovered"));
        container.stop().await;
    }

    #[test]
    fn test_snapshot_readiness() {
        let snapshot = ContainerSnapshot {
            state: ContainerState::Running,
            min_consumers_per_queue: 1,
            max_consumers_per_queue: 1,
            queues: vec![QueueSnapshot {
                name: "orders".into(),
                state: Some(QueueState::Missing),
                consumers: vec![],
            }],
        };
        assert!(!snapshot.is_ready());

        let healthy = ContainerSnapshot {
            queues: vec![],
            ..snapshot
        };
        assert!(healthy.is_ready());
    }
}
