//! Bounded exponential backoff for source and resolver I/O
//!
//! Only errors that report [`JoinError::is_transient`] are retried. Everything
//! else is returned on the first attempt.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{JoinError, Result};

/// Default number of attempts, including the first one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

/// Default ceiling for a single delay
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Policy that gives up after the first failure
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    if e.is_transient() {
                        debug!(operation, attempts = attempt, "Retry budget exhausted");
                    }
                    return Err(exhausted(e, operation, attempt));
                },
            }
        }
    }
}

fn exhausted(err: JoinError, operation: &str, attempts: u32) -> JoinError {
    match err {
        JoinError::SourceUnavailable(msg) if attempts > 1 => JoinError::SourceUnavailable(format!(
            "{operation} failed after {attempts} attempts: {msg}"
        )),
        JoinError::ResolverUnavailable(msg) if attempts > 1 => JoinError::ResolverUnavailable(
            format!("{operation} failed after {attempts} attempts: {msg}"),
        ),
        other => other,
    }
}
