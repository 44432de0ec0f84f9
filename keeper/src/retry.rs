//! Bounded retries with exponential backoff.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Exponential backoff: `initial`, `2*initial`, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Retry policy for one kind of operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on each individual attempt
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. `on_attempt` observes every attempt's outcome.
    pub async fn run<T, F, Fut>(
        &self,
        stage: &str,
        mut op: F,
        mut on_attempt: impl FnMut(u32, &Result<T>),
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = Backoff::new(self.initial_backoff, self.max_backoff);
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = match tokio::time::timeout(self.attempt_timeout, op(attempt)).await {
                Ok(r) => r,
                Err(_) => Err(Error::StageTimeout {
                    stage: stage.to_string(),
                    timeout: self.attempt_timeout,
                }),
            };
            on_attempt(attempt, &outcome);

            match outcome {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts && is_transient(&e) => {
                    let delay = backoff.next_delay();
                    debug!(stage, attempt, ?delay, error = %e, "Retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Retryable errors plus per-attempt timeouts.
fn is_transient(e: &Error) -> bool {
    e.is_retryable() || matches!(e, Error::StageTimeout { .. })
}
