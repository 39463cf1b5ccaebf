//! Recovery policies for automatic reconnects
//!
//! - `RetryPolicy`: when to retry a failed reconnect
//! - `NoRetry`: the default, never retries
//! - `ExponentialBackoff`: growing, jittered delays

pub mod backoff;
pub mod retry;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use retry::{policy_from_config, NoRetry, RetryPolicy};
