//! Bounded retry with a per-attempt deadline.
//!
//! Every attempt runs under `tokio::time::timeout`. An attempt that misses
//! its deadline is dropped at that point and counts as a failure, so a
//! stuck open call cannot hold up the caller beyond
//! `max_retries * (timeout + delay)`. Operations that own OS resources must
//! release them on drop (e.g. `kill_on_drop` for child processes).

use anyhow::anyhow;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Every attempt of `operation` failed.
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempts: {last_error:#}")]
pub struct RetryExhausted {
    pub operation: String,
    pub attempts: u32,
    pub last_error: anyhow::Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Zero is treated as one.
    pub max_retries: u32,
    /// Pause between a failed attempt and the next one.
    pub delay: Duration,
    /// Deadline for a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration, timeout: Duration) -> Self {
        Self {
            max_retries,
            delay,
            timeout,
        }
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// `operation` names the call in logs and in the returned error.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.max_retries.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let failure = match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => anyhow!("attempt timed out after {:?}", self.timeout),
            };

            warn!(
                operation,
                attempt,
                max_attempts,
                error = %failure,
                "attempt failed"
            );

            if attempt >= max_attempts {
                error!(operation, attempts = attempt, "giving up");
                return Err(RetryExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: failure,
                });
            }

            tokio::time::sleep(self.delay).await;
        }
    }
}
