//! Retry policy and transient-error classification
//!
//! Transient errors (network, throttling, server errors) are retried with
//! exponential backoff: `base`, `2 * base`, `4 * base`, ... capped at
//! `max_delay`. Everything else fails immediately.

use std::io::ErrorKind;
use std::time::Duration;

use anyhow::Result;
use dirsync_core::ports::TransientError;
use tracing::{info, warn};

/// How often and how patiently an operation is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Backoff before the next attempt, given how many attempts have failed
    ///
    /// `failed_attempts` starts at 1: the first retry waits `base_delay`.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Returns true if another attempt is allowed after `attempts_made`
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(6, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// I/O error kinds that usually clear up on their own
const TRANSIENT_IO_KINDS: &[ErrorKind] = &[
    ErrorKind::TimedOut,
    ErrorKind::ConnectionReset,
    ErrorKind::ConnectionAborted,
    ErrorKind::ConnectionRefused,
    ErrorKind::NotConnected,
    ErrorKind::Interrupted,
    ErrorKind::BrokenPipe,
    ErrorKind::WouldBlock,
];

/// Message fragments of network, throttling and server-side failures
const TRANSIENT_MESSAGES: &[&str] = &[
    "network",
    "connection reset",
    "connection refused",
    "connection closed",
    "timed out",
    "timeout",
    "dns",
    "broken pipe",
    "too many requests",
    "rate limit",
    "slow down",
    "server error",
    "service unavailable",
    "bad gateway",
];

/// Determines whether an error is transient (retryable)
///
/// Checks, in order: a [`TransientError`] anywhere in the chain, an
/// [`std::io::Error`] of a transient kind anywhere in the chain, and finally
/// well-known message fragments.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<TransientError>().is_some() {
        return true;
    }
    for cause in err.chain() {
        if cause.downcast_ref::<TransientError>().is_some() {
            return true;
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if TRANSIENT_IO_KINDS.contains(&io.kind()) {
                return true;
            }
        }
    }

    let err_str = format!("{err:#}").to_lowercase();
    TRANSIENT_MESSAGES.iter().any(|m| err_str.contains(m))
}

/// Executes an async operation with exponential backoff retry
///
/// Only retries on transient errors. Non-transient errors are returned
/// immediately, as is the last error once the policy is exhausted.
pub async fn with_retry<F, Fut, T>(operation_name: &str, policy: &RetryPolicy, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                if !policy.allows_another(attempt) || !is_transient_error(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
