//! Retry policy for reconnects triggered by connection loss
//!
//! Explicit `connect` and `force_reconnect` calls never consult the policy;
//! their result goes straight back to the caller.

use super::backoff::{BackoffConfig, ExponentialBackoff};
use std::time::Duration;

/// Decides whether and when a failed automatic reconnect is retried
pub trait RetryPolicy: Send + 'static {
    /// Delay before the next attempt, or `None` to give up
    fn next_delay(&mut self) -> Option<Duration>;

    /// Called after a successful reconnect
    fn reset(&mut self);
}

/// Never retry: a failed automatic reconnect leaves the pipe disconnected
/// until someone calls `connect` or `force_reconnect`
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_delay(&mut self) -> Option<Duration> {
        None
    }

    fn reset(&mut self) {}
}

/// Build the policy selected by configuration
pub fn policy_from_config(config: Option<&BackoffConfig>) -> Box<dyn RetryPolicy> {
    match config {
        Some(config) => Box::new(ExponentialBackoff::with_config(config.clone())),
        None => Box::new(NoRetry),
    }
}
