//! Adaptive concurrency.
//!
//! Every monitor tick the controller looks at the receive streaks of one
//! queue's consumers and proposes at most one change:
//!
//! - **StartOne**: every consumer has at least `consecutive_active_trigger`
//!   deliveries in a row, the queue is below its max, and
//!   `start_consumer_min_interval` has passed since the last start
//! - **StopOne**: some consumer has at least `consecutive_idle_trigger` empty
//!   receives in a row, the queue is above its min, and
//!   `stop_consumer_min_interval` has passed since the last stop; the
//!   least-recently-started idle consumer is retired

use crate::config::ContainerConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-queue consumer count limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencyBounds {
    pub min: usize,
    pub max: usize,
}

impl ConcurrencyBounds {
    pub fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub fn fixed(count: usize) -> Self {
        Self::new(count, count)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min == 0 {
            return Err("min consumers per queue must be at least 1".into());
        }
        if self.min > self.max {
            return Err(format!(
                "min consumers per queue ({}) exceeds max ({})",
                self.min, self.max
            ));
        }
        Ok(())
    }

    /// Consumers to add to reach `min`
    pub fn deficit(&self, count: usize) -> usize {
        self.min.saturating_sub(count)
    }

    /// Consumers to remove to get down to `max`
    pub fn surplus(&self, count: usize) -> usize {
        count.saturating_sub(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingSettings {
    pub consecutive_active_trigger: u32,
    pub consecutive_idle_trigger: u32,
    pub start_consumer_min_interval: Duration,
    pub stop_consumer_min_interval: Duration,
}

impl From<&ContainerConfig> for ScalingSettings {
    fn from(config: &ContainerConfig) -> Self {
        Self {
            consecutive_active_trigger: config.consecutive_active_trigger,
            consecutive_idle_trigger: config.consecutive_idle_trigger,
            start_consumer_min_interval: config.start_consumer_min_interval,
            stop_consumer_min_interval: config.stop_consumer_min_interval,
        }
    }
}

/// Counters of one consumer at the time of a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSample {
    pub id: u64,
    pub started_at: Instant,
    pub idle_streak: u32,
    pub active_streak: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Hold,
    StartOne,
    StopOne { consumer_id: u64 },
}

#[derive(Debug)]
pub struct ScalingController {
    settings: ScalingSettings,
    last_started: HashMap<String, Instant>,
    last_stopped: HashMap<String, Instant>,
}

impl ScalingController {
    pub fn new(settings: ScalingSettings) -> Self {
        Self {
            settings,
            last_started: HashMap::new(),
            last_stopped: HashMap::new(),
        }
    }

    pub fn evaluate(
        &mut self,
        queue: &str,
        bounds: ConcurrencyBounds,
        samples: &[ConsumerSample],
        now: Instant,
    ) -> ScalingDecision {
        let count = samples.len();
        if count == 0 {
            return ScalingDecision::Hold;
        }

        if count < bounds.max
            && Self::elapsed(&self.last_started, queue, now, self.settings.start_consumer_min_interval)
            && samples
                .iter()
                .all(|sample| sample.active_streak >= self.settings.consecutive_active_trigger)
        {
            self.last_started.insert(queue.to_string(), now);
            return ScalingDecision::StartOne;
        }

        if count > bounds.min
            && Self::elapsed(&self.last_stopped, queue, now, self.settings.stop_consumer_min_interval)
        {
            let idle = samples
                .iter()
                .filter(|sample| sample.idle_streak >= self.settings.consecutive_idle_trigger)
                .min_by_key(|sample| sample.started_at);
            if let Some(victim) = idle {
                self.last_stopped.insert(queue.to_string(), now);
                return ScalingDecision::StopOne {
                    consumer_id: victim.id,
                };
            }
        }

        ScalingDecision::Hold
    }

    pub fn forget(&mut self, queue: &str) {
        self.last_started.remove(queue);
        self.last_stopped.remove(queue);
    }

    fn elapsed(last: &HashMap<String, Instant>, queue: &str, now: Instant, interval: Duration) -> bool {
        last.get(queue)
            .is_none_or(|at| now.saturating_duration_since(*at) >= interval)
    }
}
