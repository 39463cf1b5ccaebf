//! Exponential backoff for automatic reconnects
//!
//! Delays grow by `multiplier` up to `max_delay`, with optional jitter so a
//! fleet of pipes that lost the same peer does not redial in lockstep.

use super::retry::RetryPolicy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for exponential backoff
///
/// Durations serialize as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(with = "crate::config::duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "crate::config::duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Retries before giving up (None = unlimited)
    pub max_retries: Option<usize>,
    /// Randomization in [0, 1]
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: Some(10),
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Short delays and few attempts, for tests and local links
    pub fn aggressive() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_retries: Some(5),
            jitter_factor: 0.1,
        }
    }

    /// Long delays for flaky wide-area links
    pub fn conservative() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_retries: Some(20),
            jitter_factor: 0.2,
        }
    }

    /// Keep retrying until the pipe is closed
    pub fn unlimited() -> Self {
        Self {
            max_retries: None,
            ..Default::default()
        }
    }
}

/// Exponential backoff state machine
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: usize,
    delay: Duration,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        Self {
            delay: config.initial_delay,
            attempt: 0,
            config,
        }
    }

    fn jittered(&self) -> Duration {
        if self.config.jitter_factor == 0.0 {
            return self.delay;
        }

        let jitter = rand::thread_rng().gen::<f64>() * self.config.jitter_factor;
        let factor = 1.0 + jitter - self.config.jitter_factor / 2.0;
        Duration::from_secs_f64(self.delay.as_secs_f64() * factor)
    }

    /// Retries handed out since the last reset
    pub fn attempt_number(&self) -> usize {
        self.attempt
    }

    pub fn can_retry(&self) -> bool {
        self.config.max_retries.map_or(true, |max| self.attempt < max)
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }

        let delay = self.jittered();
        self.attempt += 1;
        self.delay = Duration::from_secs_f64(self.delay.as_secs_f64() * self.config.multiplier)
            .min(self.config.max_delay);

        Some(delay)
    }

    fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.config.initial_delay;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
