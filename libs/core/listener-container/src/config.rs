//! Container configuration
//!
//! `ContainerConfig` is built in code with `with_*` methods or loaded from
//! `LISTENER_*` environment variables. It is validated when the container
//! starts.

use crate::ack::AckMode;
use crate::backoff::BackOffPolicy;
use crate::client::DeliveryMode;
use crate::error::ContainerError;
use crate::scaling::ConcurrencyBounds;
use core_config::{
    env_duration_ms, env_list, env_or_default, env_parse, env_parse_optional, ConfigError,
    FromEnv,
};
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for a listener container
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Queues to consume from, in registration order
    pub queue_names: Vec<String>,

    /// Consumers kept per queue while idle
    pub min_consumers_per_queue: usize,

    /// Upper bound for adaptive scaling
    pub max_consumers_per_queue: usize,

    pub ack_mode: AckMode,

    /// Open consumer channels in transactional mode
    pub channel_transacted: bool,

    /// Successful deliveries acknowledged together (also the local transaction size)
    pub batch_size: usize,

    /// Unacknowledged deliveries the broker may push to one consumer
    pub prefetch_count: u16,

    pub delivery_mode: DeliveryMode,

    /// Empty-receive period after which a consumer counts one idle cycle
    pub receive_timeout: Duration,

    /// Publish an idle event when a consumer received nothing for this long
    pub idle_event_interval: Option<Duration>,

    pub consecutive_active_trigger: u32,

    pub consecutive_idle_trigger: u32,

    pub start_consumer_min_interval: Duration,

    pub stop_consumer_min_interval: Duration,

    /// Period of the scaling and restart supervisor
    pub monitor_interval: Duration,

    /// Back-off between recovery attempts after connection failures
    pub recovery_back_off: BackOffPolicy,

    /// Stop the container when a queue is missing instead of pausing it
    pub missing_queues_fatal: bool,

    /// Stop the container on the first authentication failure
    pub possible_authentication_failure_fatal: bool,

    /// Time granted to in-flight deliveries on stop before channels are force-closed
    pub shutdown_timeout: Duration,

    /// How often a missing queue is re-declared or re-checked
    pub failed_declaration_retry_interval: Duration,

    /// Requeue failed deliveries unless the listener error says otherwise
    pub default_requeue_rejected: bool,

    /// Close the shared connection when the container stops
    pub owns_connection: bool,
}

impl ContainerConfig {
    /// Create a new ContainerConfig with default settings
    pub fn new<I, S>(queue_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue_names: queue_names.into_iter().map(Into::into).collect(),
            min_consumers_per_queue: 1,
            max_consumers_per_queue: 1,
            ack_mode: AckMode::Auto,
            channel_transacted: false,
            batch_size: 1,
            prefetch_count: 250,
            delivery_mode: DeliveryMode::Push,
            receive_timeout: Duration::from_secs(1),
            idle_event_interval: None,
            consecutive_active_trigger: 10,
            consecutive_idle_trigger: 10,
            start_consumer_min_interval: Duration::from_secs(10),
            stop_consumer_min_interval: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(5),
            recovery_back_off: BackOffPolicy::default(),
            missing_queues_fatal: false,
            possible_authentication_failure_fatal: true,
            shutdown_timeout: Duration::from_secs(5),
            failed_declaration_retry_interval: Duration::from_secs(5),
            default_requeue_rejected: true,
            owns_connection: true,
        }
    }

    /// Fixed number of consumers per queue
    pub fn with_consumers_per_queue(mut self, count: usize) -> Self {
        self.min_consumers_per_queue = count;
        self.max_consumers_per_queue = count;
        self
    }

    /// Adaptive bounds for consumers per queue
    pub fn with_concurrency(mut self, min: usize, max: usize) -> Self {
        self.min_consumers_per_queue = min;
        self.max_consumers_per_queue = max;
        self
    }

    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn with_channel_transacted(mut self, transacted: bool) -> Self {
        self.channel_transacted = transacted;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch: u16) -> Self {
        self.prefetch_count = prefetch;
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_idle_event_interval(mut self, interval: Duration) -> Self {
        self.idle_event_interval = Some(interval);
        self
    }

    /// Set the consecutive active and idle triggers
    pub fn with_scaling_triggers(mut self, active: u32, idle: u32) -> Self {
        self.consecutive_active_trigger = active;
        self.consecutive_idle_trigger = idle;
        self
    }

    /// Set the minimum spacing between consumer starts and stops
    pub fn with_scaling_intervals(mut self, start: Duration, stop: Duration) -> Self {
        self.start_consumer_min_interval = start;
        self.stop_consumer_min_interval = stop;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_recovery_back_off(mut self, policy: BackOffPolicy) -> Self {
        self.recovery_back_off = policy;
        self
    }

    pub fn with_missing_queues_fatal(mut self, fatal: bool) -> Self {
        self.missing_queues_fatal = fatal;
        self
    }

    pub fn with_possible_authentication_failure_fatal(mut self, fatal: bool) -> Self {
        self.possible_authentication_failure_fatal = fatal;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_failed_declaration_retry_interval(mut self, interval: Duration) -> Self {
        self.failed_declaration_retry_interval = interval;
        self
    }

    pub fn with_default_requeue_rejected(mut self, requeue: bool) -> Self {
        self.default_requeue_rejected = requeue;
        self
    }

    pub fn with_owns_connection(mut self, owns: bool) -> Self {
        self.owns_connection = owns;
        self
    }

    pub fn bounds(&self) -> ConcurrencyBounds {
        ConcurrencyBounds::new(self.min_consumers_per_queue, self.max_consumers_per_queue)
    }

    /// Reject contradictory or degenerate settings
    pub fn validate(&self) -> Result<(), ContainerError> {
        self.bounds().validate().map_err(ContainerError::Config)?;

        if self.ack_mode == AckMode::None && self.channel_transacted {
            return Err(ContainerError::config(
                "ack mode NONE cannot be combined with a transacted channel",
            ));
        }
        if self.batch_size == 0 {
            return Err(ContainerError::config("batch size must be at least 1"));
        }
        if self.prefetch_count == 0 {
            return Err(ContainerError::config("prefetch count must be at least 1"));
        }
        if self.receive_timeout.is_zero() {
            return Err(ContainerError::config("receive timeout must be positive"));
        }
        if self.monitor_interval.is_zero() {
            return Err(ContainerError::config("monitor interval must be positive"));
        }
        if self.idle_event_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(ContainerError::config("idle event interval must be positive"));
        }
        if let DeliveryMode::Pull { poll_interval } = self.delivery_mode {
            if poll_interval.is_zero() {
                return Err(ContainerError::config("poll interval must be positive"));
            }
        }
        if self.consecutive_active_trigger == 0 || self.consecutive_idle_trigger == 0 {
            return Err(ContainerError::config("scaling triggers must be at least 1"));
        }
        self.recovery_back_off
            .validate()
            .map_err(ContainerError::Config)?;

        let mut seen = HashSet::new();
        for queue in &self.queue_names {
            if queue.trim().is_empty() {
                return Err(ContainerError::config("queue names must not be empty"));
            }
            if !seen.insert(queue.as_str()) {
                return Err(ContainerError::DuplicateQueue(queue.clone()));
            }
        }
        Ok(())
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl FromEnv for ContainerConfig {
    /// Reads `LISTENER_*` environment variables; unset values keep their defaults.
    ///
    /// Durations are in milliseconds. `LISTENER_RECOVERY_MULTIPLIER` above 1.0
    /// selects an exponential recovery back-off.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = ContainerConfig::default();

        let ack_mode = env_or_default("LISTENER_ACK_MODE", defaults.ack_mode.as_ref())
            .parse::<AckMode>()
            .map_err(|e| ConfigError::ParseError {
                key: "LISTENER_ACK_MODE".to_string(),
                details: e.to_string(),
            })?;

        let delivery_mode = match env_or_default("LISTENER_DELIVERY_MODE", "push")
            .to_ascii_lowercase()
            .as_str()
        {
            "push" => DeliveryMode::Push,
            "pull" => DeliveryMode::Pull {
                poll_interval: env_duration_ms(
                    "LISTENER_POLL_INTERVAL_MS",
                    Duration::from_millis(100),
                )?,
            },
            other => {
                return Err(ConfigError::ParseError {
                    key: "LISTENER_DELIVERY_MODE".to_string(),
                    details: format!("expected 'push' or 'pull', got '{other}'"),
                })
            }
        };

        let min = env_parse("LISTENER_MIN_CONSUMERS", defaults.min_consumers_per_queue)?;
        let max = env_parse("LISTENER_MAX_CONSUMERS", min.max(defaults.max_consumers_per_queue))?;

        Ok(Self {
            queue_names: env_list("LISTENER_QUEUES"),
            min_consumers_per_queue: min,
            max_consumers_per_queue: max,
            ack_mode,
            channel_transacted: env_parse("LISTENER_CHANNEL_TRANSACTED", defaults.channel_transacted)?,
            batch_size: env_parse("LISTENER_BATCH_SIZE", defaults.batch_size)?,
            prefetch_count: env_parse("LISTENER_PREFETCH", defaults.prefetch_count)?,
            delivery_mode,
            receive_timeout: env_duration_ms("LISTENER_RECEIVE_TIMEOUT_MS", defaults.receive_timeout)?,
            idle_event_interval: env_parse_optional::<u64>("LISTENER_IDLE_EVENT_INTERVAL_MS")?
                .map(Duration::from_millis),
            consecutive_active_trigger: env_parse(
                "LISTENER_ACTIVE_TRIGGER",
                defaults.consecutive_active_trigger,
            )?,
            consecutive_idle_trigger: env_parse(
                "LISTENER_IDLE_TRIGGER",
                defaults.consecutive_idle_trigger,
            )?,
            start_consumer_min_interval: env_duration_ms(
                "LISTENER_START_CONSUMER_MIN_INTERVAL_MS",
                defaults.start_consumer_min_interval,
            )?,
            stop_consumer_min_interval: env_duration_ms(
                "LISTENER_STOP_CONSUMER_MIN_INTERVAL_MS",
                defaults.stop_consumer_min_interval,
            )?,
            monitor_interval: env_duration_ms("LISTENER_MONITOR_INTERVAL_MS", defaults.monitor_interval)?,
            recovery_back_off: recovery_back_off_from_env()?,
            missing_queues_fatal: env_parse(
                "LISTENER_MISSING_QUEUES_FATAL",
                defaults.missing_queues_fatal,
            )?,
            possible_authentication_failure_fatal: env_parse(
                "LISTENER_AUTH_FAILURE_FATAL",
                defaults.possible_authentication_failure_fatal,
            )?,
            shutdown_timeout: env_duration_ms("LISTENER_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout)?,
            failed_declaration_retry_interval: env_duration_ms(
                "LISTENER_DECLARATION_RETRY_INTERVAL_MS",
                defaults.failed_declaration_retry_interval,
            )?,
            default_requeue_rejected: env_parse(
                "LISTENER_DEFAULT_REQUEUE_REJECTED",
                defaults.default_requeue_rejected,
            )?,
            owns_connection: defaults.owns_connection,
        })
    }
}

fn recovery_back_off_from_env() -> Result<BackOffPolicy, ConfigError> {
    let initial = env_duration_ms("LISTENER_RECOVERY_INTERVAL_MS", Duration::from_secs(5))?;
    let multiplier: f64 = env_parse("LISTENER_RECOVERY_MULTIPLIER", 1.0)?;
    let max_attempts = env_parse_optional::<u32>("LISTENER_RECOVERY_MAX_ATTEMPTS")?;

    let policy = if multiplier > 1.0 {
        let max_interval = env_duration_ms("LISTENER_RECOVERY_MAX_INTERVAL_MS", Duration::from_secs(60))?;
        BackOffPolicy::exponential(initial, multiplier, max_interval)
    } else {
        BackOffPolicy::fixed_unlimited(initial)
    };

    Ok(match max_attempts {
        Some(attempts) => policy.with_max_attempts(attempts),
        None => policy,
    })
}
