//! Back-off policies for broker recovery and listener retries.
//!
//! A [`BackOffPolicy`] is immutable configuration; [`BackOffExecution`] walks
//! it one attempt at a time and returns `None` once the attempts run out.
//!
//! ## Example
//!
//! ```rust
//! use listener_container::BackOffPolicy;
//! use std::time::Duration;
//!
//! let mut execution = BackOffPolicy::fixed(Duration::from_millis(100), 3).start();
//! assert_eq!(execution.next_backoff(), Some(Duration::from_millis(100)));
//! assert_eq!(execution.next_backoff(), Some(Duration::from_millis(100)));
//! assert_eq!(execution.next_backoff(), Some(Duration::from_millis(100)));
//! assert_eq!(execution.next_backoff(), None);
//! ```

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum BackOffPolicy {
    /// Same delay before every attempt.
    Fixed {
        interval: Duration,
        /// `None` retries forever.
        max_attempts: Option<u32>,
    },
    /// Delay grows by `multiplier` per attempt, capped at `max_interval`.
    Exponential {
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Duration,
        max_attempts: Option<u32>,
    },
}

impl Default for BackOffPolicy {
    fn default() -> Self {
        BackOffPolicy::fixed_unlimited(Duration::from_secs(5))
    }
}

impl BackOffPolicy {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        BackOffPolicy::Fixed {
            interval,
            max_attempts: Some(max_attempts),
        }
    }

    pub fn fixed_unlimited(interval: Duration) -> Self {
        BackOffPolicy::Fixed {
            interval,
            max_attempts: None,
        }
    }

    pub fn exponential(initial_interval: Duration, multiplier: f64, max_interval: Duration) -> Self {
        BackOffPolicy::Exponential {
            initial_interval,
            multiplier,
            max_interval,
            max_attempts: None,
        }
    }

    /// Limit the number of attempts.
    pub fn with_max_attempts(self, attempts: u32) -> Self {
        match self {
            BackOffPolicy::Fixed { interval, .. } => BackOffPolicy::Fixed {
                interval,
                max_attempts: Some(attempts),
            },
            BackOffPolicy::Exponential {
                initial_interval,
                multiplier,
                max_interval,
                ..
            } => BackOffPolicy::Exponential {
                initial_interval,
                multiplier,
                max_interval,
                max_attempts: Some(attempts),
            },
        }
    }

    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            BackOffPolicy::Fixed { max_attempts, .. }
            | BackOffPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    /// Delay before the given 1-based attempt, or `None` past the limit.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || self.max_attempts().is_some_and(|max| attempt > max) {
            return None;
        }

        match self {
            BackOffPolicy::Fixed { interval, .. } => Some(*interval),
            BackOffPolicy::Exponential {
                initial_interval,
                multiplier,
                max_interval,
                ..
            } => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let secs = initial_interval.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max_interval.as_secs_f64() {
                    Some(*max_interval)
                } else {
                    Some(Duration::from_secs_f64(secs))
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if let BackOffPolicy::Exponential {
            initial_interval,
            multiplier,
            max_interval,
            ..
        } = self
        {
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(format!("back-off multiplier must be >= 1.0, got {multiplier}"));
            }
            if max_interval < initial_interval {
                return Err("back-off max interval is shorter than the initial interval".into());
            }
        }
        Ok(())
    }

    pub fn start(&self) -> BackOffExecution {
        BackOffExecution {
            policy: self.clone(),
            attempts: 0,
        }
    }
}

/// Stateful walk over a [`BackOffPolicy`].
#[derive(Debug, Clone)]
pub struct BackOffExecution {
    policy: BackOffPolicy,
    attempts: u32,
}

impl BackOffExecution {
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for_attempt(self.attempts.saturating_add(1))?;
        self.attempts += 1;
        Some(delay)
    }

    /// Delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
