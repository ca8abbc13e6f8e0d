//! Failure classification and recovery scheduling.
//!
//! The supervisor turns consumer failures into [`RecoveryAction`]s and keeps
//! the per-queue [`QueueState`]. It does no I/O; the container applies its
//! decisions.
//!
//! ## Queue states
//!
//! ```text
//!              missing queue                 declared again
//! ┌──────────┐ ──────────────> ┌─────────┐ ───────────────> ┌──────────┐
//! │ DECLARED │                 │ MISSING │                  │ DECLARED │
//! └──────────┘ ──────┐         └─────────┘                  └──────────┘
//!      ^             │ connection failure
//!      │ consume ok  v
//!      │       ┌────────────┐   back-off exhausted   ┌───────┐
//!      └────── │ RECOVERING │ ─────────────────────> │ FATAL │
//!              └────────────┘                        └───────┘
//! ```
//!
//! Connection and (non-fatal) authentication failures share one recovery
//! round. A round consumes one back-off attempt per failed restart; the first
//! successful ConsumeOk ends it.

use crate::backoff::{BackOffExecution, BackOffPolicy};
use crate::config::ContainerConfig;
use crate::error::{ClientError, FailureKind};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    Declared,
    Missing,
    Recovering,
    Fatal,
}

impl QueueState {
    /// Whether consumers may run against the queue
    pub fn is_consumable(&self) -> bool {
        matches!(self, QueueState::Declared | QueueState::Recovering)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Replace the consumer on the next monitor tick
    Restart { queue: String },
    /// Remove the queue's consumers until it is declared again
    PauseQueue { queue: String },
    /// Restart once `delay` has passed
    ScheduleRetry { delay: Duration, attempt: u32 },
    /// Already covered by the current recovery round
    AwaitRound,
    /// Stop the container
    Fatal { reason: String },
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub back_off: BackOffPolicy,
    pub missing_queues_fatal: bool,
    pub possible_authentication_failure_fatal: bool,
    pub failed_declaration_retry_interval: Duration,
}

impl From<&ContainerConfig> for RecoverySettings {
    fn from(config: &ContainerConfig) -> Self {
        Self {
            back_off: config.recovery_back_off.clone(),
            missing_queues_fatal: config.missing_queues_fatal,
            possible_authentication_failure_fatal: config.possible_authentication_failure_fatal,
            failed_declaration_retry_interval: config.failed_declaration_retry_interval,
        }
    }
}

#[derive(Debug)]
struct QueueRecord {
    state: QueueState,
    next_declaration_at: Option<Instant>,
}

#[derive(Debug)]
struct RecoveryRound {
    execution: BackOffExecution,
    next_attempt_at: Instant,
    in_flight: bool,
}

#[derive(Debug)]
pub struct RecoverySupervisor {
    settings: RecoverySettings,
    queues: HashMap<String, QueueRecord>,
    round: Option<RecoveryRound>,
}

impl RecoverySupervisor {
    pub fn new(settings: RecoverySettings) -> Self {
        Self {
            settings,
            queues: HashMap::new(),
            round: None,
        }
    }

    pub fn track(&mut self, queue: &str) {
        self.queues
            .entry(queue.to_string())
            .or_insert(QueueRecord {
                state: QueueState::Declared,
                next_declaration_at: None,
            });
    }

    pub fn forget(&mut self, queue: &str) {
        self.queues.remove(queue);
        if self.queues.is_empty() {
            self.round = None;
        }
    }

    pub fn queue_state(&self, queue: &str) -> Option<QueueState> {
        self.queues.get(queue).map(|record| record.state)
    }

    pub fn is_consumable(&self, queue: &str) -> bool {
        self.queue_state(queue)
            .is_some_and(|state| state.is_consumable())
    }

    pub fn on_consume_ok(&mut self, queue: &str) {
        self.round = None;
        if let Some(record) = self.queues.get_mut(queue) {
            if record.state == QueueState::Recovering {
                record.state = QueueState::Declared;
            }
        }
    }

    pub fn on_failure(&mut self, queue: &str, error: &ClientError, now: Instant) -> RecoveryAction {
        match error.kind() {
            FailureKind::MissingQueue if self.settings.missing_queues_fatal => {
                self.set_state(queue, QueueState::Fatal);
                RecoveryAction::Fatal {
                    reason: format!("queue '{queue}' is missing and missing queues are fatal"),
                }
            }
            FailureKind::MissingQueue => {
                let next = now + self.settings.failed_declaration_retry_interval;
                if let Some(record) = self.queues.get_mut(queue) {
                    record.state = QueueState::Missing;
                    record.next_declaration_at = Some(next);
                }
                RecoveryAction::PauseQueue {
                    queue: queue.to_string(),
                }
            }
            FailureKind::Authentication if self.settings.possible_authentication_failure_fatal => {
                self.set_state(queue, QueueState::Fatal);
                RecoveryAction::Fatal {
                    reason: format!("authentication failure: {error}"),
                }
            }
            FailureKind::Authentication | FailureKind::Connection => {
                self.set_state(queue, QueueState::Recovering);
                self.schedule_retry(error, now)
            }
            FailureKind::Channel | FailureKind::Cancelled => RecoveryAction::Restart {
                queue: queue.to_string(),
            },
        }
    }

    fn schedule_retry(&mut self, error: &ClientError, now: Instant) -> RecoveryAction {
        // A waiting round already accounts for this outage
        if self.round.as_ref().is_some_and(|round| !round.in_flight) {
            return RecoveryAction::AwaitRound;
        }

        let back_off = &self.settings.back_off;
        let round = self.round.get_or_insert_with(|| RecoveryRound {
            execution: back_off.start(),
            next_attempt_at: now,
            in_flight: false,
        });
        round.in_flight = false;

        match round.execution.next_backoff() {
            Some(delay) => {
                round.next_attempt_at = now + delay;
                RecoveryAction::ScheduleRetry {
                    delay,
                    attempt: round.execution.attempts(),
                }
            }
            None => {
                let attempts = round.execution.attempts();
                self.round = None;
                RecoveryAction::Fatal {
                    reason: format!("recovery back-off exhausted after {attempts} attempts: {error}"),
                }
            }
        }
    }

    /// Whether consumer starts must wait for the recovery round
    pub fn restarts_blocked(&self, now: Instant) -> bool {
        self.round
            .as_ref()
            .is_some_and(|round| round.in_flight || now < round.next_attempt_at)
    }

    /// Whether a recovery round is waiting for its next attempt and the delay has passed
    pub fn attempt_due(&self, now: Instant) -> bool {
        self.round
            .as_ref()
            .is_some_and(|round| !round.in_flight && now >= round.next_attempt_at)
    }

    /// Mark the due attempt as launched
    pub fn begin_attempt(&mut self) {
        if let Some(round) = self.round.as_mut() {
            round.in_flight = true;
        }
    }

    /// Drop a round with nothing left to restart
    pub fn abandon_round(&mut self) {
        self.round = None;
    }

    /// Earliest instant at which recovery work becomes due
    pub fn next_deadline(&self) -> Option<Instant> {
        let round = self
            .round
            .as_ref()
            .filter(|round| !round.in_flight)
            .map(|round| round.next_attempt_at);
        let declarations = self
            .queues
            .values()
            .filter(|record| record.state == QueueState::Missing)
            .filter_map(|record| record.next_declaration_at);

        round.into_iter().chain(declarations).min()
    }

    /// Missing queues whose re-declaration is due; pushes their next check out
    pub fn queues_due_for_declaration(&mut self, now: Instant) -> Vec<String> {
        let interval = self.settings.failed_declaration_retry_interval;
        let mut due = Vec::new();
        for (queue, record) in &mut self.queues {
            if record.state == QueueState::Missing
                && record.next_declaration_at.is_some_and(|at| at <= now)
            {
                record.next_declaration_at = Some(now + interval);
                due.push(queue.clone());
            }
        }
        due.sort();
        due
    }

    /// Returns true when a missing queue became consumable again
    pub fn on_declaration_result(&mut self, queue: &str, exists: bool) -> bool {
        match self.queues.get_mut(queue) {
            Some(record) if record.state == QueueState::Missing && exists => {
                record.state = QueueState::Declared;
                record.next_declaration_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn mark_all_fatal(&mut self) {
        for record in self.queues.values_mut() {
            record.state = QueueState::Fatal;
        }
        self.round = None;
    }

    fn set_state(&mut self, queue: &str, state: QueueState) {
        if let Some(record) = self.queues.get_mut(queue) {
            record.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RecoverySettings {
        RecoverySettings {
            back_off: BackOffPolicy::fixed(Duration::from_millis(100), 3),
            missing_queues_fatal: false,
            possible_authentication_failure_fatal: true,
            failed_declaration_retry_interval: Duration::from_secs(5),
        }
    }

    fn supervisor(settings: RecoverySettings) -> RecoverySupervisor {
        let mut supervisor = RecoverySupervisor::new(settings);
        supervisor.track("q1");
        supervisor.track("q2");
        supervisor
    }

    fn refused() -> ClientError {
        ClientError::Connection("connection refused".into())
    }

    #[test]
    fn test_channel_failures_restart_without_back_off() {
        let mut supervisor = supervisor(settings());
        let now = Instant::now();

        let action = supervisor.on_failure("q1", &ClientError::ChannelClosed, now);

        assert_eq!(action, RecoveryAction::Restart { queue: "q1".into() });
        assert!(!supervisor.restarts_blocked(now));
        assert_eq!(supervisor.queue_state("q1"), Some(QueueState::Declared));
    }

    #[test]
    fn test_back_off_exhaustion_is_fatal() {
        let mut supervisor = supervisor(settings());
        let mut now = Instant::now();

        // initial failure plus three failed restarts
        for attempt in 1..=3 {
            let action = supervisor.on_failure("q1", &refused(), now);
            assert_eq!(
                action,
                RecoveryAction::ScheduleRetry {
                    delay: Duration::from_millis(100),
                    attempt
                }
            );
            assert!(supervisor.restarts_blocked(now));
            now += Duration::from_millis(100);
            assert!(supervisor.attempt_due(now));
            supervisor.begin_attempt();
            assert!(supervisor.restarts_blocked(now));
        }

        let action = supervisor.on_failure("q1", &refused(), now);
        assert!(matches!(action, RecoveryAction::Fatal { reason } if reason.contains("3 attempts")));
    }

    #[test]
    fn test_concurrent_failures_share_one_round() {
        let mut supervisor = supervisor(settings());
        let now = Instant::now();

        assert!(matches!(
            supervisor.on_failure("q1", &refused(), now),
            RecoveryAction::ScheduleRetry { attempt: 1, .. }
        ));
        assert_eq!(supervisor.on_failure("q2", &refused(), now), RecoveryAction::AwaitRound);
        assert_eq!(supervisor.queue_state("q2"), Some(QueueState::Recovering));
    }

    #[test]
    fn test_consume_ok_resets_round() {
        let mut supervisor = supervisor(settings());
        let now = Instant::now();

        supervisor.on_failure("q1", &refused(), now);
        supervisor.begin_attempt();
        supervisor.on_consume_ok("q1");

        assert!(!supervisor.restarts_blocked(now));
        assert_eq!(supervisor.queue_state("q1"), Some(QueueState::Declared));
        assert!(matches!(
            supervisor.on_failure("q1", &refused(), now),
            RecoveryAction::ScheduleRetry { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_authentication_failure_fatal_by_default() {
        let mut supervisor = supervisor(settings());
        let action = supervisor.on_failure(
            "q1",
            &ClientError::Authentication("ACCESS_REFUSED".into()),
            Instant::now(),
        );
        assert!(matches!(action, RecoveryAction::Fatal { .. }));
        assert_eq!(supervisor.queue_state("q1"), Some(QueueState::Fatal));
    }

    #[test]
    fn test_authentication_failure_retried_when_not_fatal() {
        let mut settings = settings();
        settings.possible_authentication_failure_fatal = false;
        let mut supervisor = supervisor(settings);

        let action = supervisor.on_failure(
            "q1",
            &ClientError::Authentication("ACCESS_REFUSED".into()),
            Instant::now(),
        );
        assert!(matches!(action, RecoveryAction::ScheduleRetry { .. }));
    }

    #[test]
    fn test_missing_queue_pauses_and_recovers() {
        let mut supervisor = supervisor(settings());
        let now = Instant::now();

        let action = supervisor.on_failure("q1", &ClientError::queue_not_found("q1"), now);
        assert_eq!(action, RecoveryAction::PauseQueue { queue: "q1".into() });
        assert_eq!(supervisor.queue_state("q1"), Some(QueueState::Missing));
        assert!(!supervisor.is_consumable("q1"));
        assert!(supervisor.is_consumable("q2"));
        assert_eq!(supervisor.next_deadline(), Some(now + Duration::from_secs(5)));

        assert!(supervisor.queues_due_for_declaration(now).is_empty());
        let later = now + Duration::from_secs(5);
        assert_eq!(supervisor.queues_due_for_declaration(later), vec!["q1".to_string()]);
        assert!(supervisor.queues_due_for_declaration(later).is_empty());

        assert!(!supervisor.on_declaration_result("q1", false));
        assert!(supervisor.on_declaration_result("q1", true));
        assert_eq!(supervisor.queue_state("q1"), Some(QueueState::Declared));
        assert_eq!(supervisor.next_deadline(), None);
    }

    #[test]
    fn test_missing_queue_fatal() {
        let mut settings = settings();
        settings.missing_queues_fatal = true;
        let mut supervisor = supervisor(settings);

        let action = supervisor.on_failure("q1", &ClientError::queue_not_found("q1"), Instant::now());
        assert!(matches!(action, RecoveryAction::Fatal { .. }));
    }

    #[test]
    fn test_forgetting_last_queue_drops_round() {
        let mut supervisor = supervisor(settings());
        let now = Instant::now();
        supervisor.on_failure("q1", &refused(), now);

        supervisor.forget("q1");
        assert!(supervisor.restarts_blocked(now));
        supervisor.forget("q2");
        assert!(!supervisor.restarts_blocked(now));
        assert_eq!(supervisor.queue_state("q1"), None);
    }
}
