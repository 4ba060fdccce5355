//! Bounded retry with linear backoff.
//!
//! Every retry loop in the crate goes through [`RetryPolicy::run`] so the
//! ceiling and backoff are configured in one place.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// Attempts made by the fetcher: one request plus five retries.
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 6;

/// Attempts made by callers that poll a rendered page for content.
pub const DEFAULT_CALLER_ATTEMPTS: u32 = 10;

/// Backoff unit; the wait before retry `n` is `n * DEFAULT_BACKOFF_STEP`.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, backoff_step: Duration) -> Self {
        Self {
            max_attempts,
            backoff_step,
        }
    }

    /// Policy used for individual HTTP requests.
    #[must_use]
    pub const fn fetch() -> Self {
        Self::new(DEFAULT_FETCH_ATTEMPTS, DEFAULT_BACKOFF_STEP)
    }

    /// Policy used by callers retrying a whole render-and-extract step.
    #[must_use]
    pub const fn caller() -> Self {
        Self::new(DEFAULT_CALLER_ATTEMPTS, DEFAULT_BACKOFF_STEP)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent.
    ///
    /// The operation receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `operation`.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        label: &str,
        mut operation: F,
        is_retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && is_retryable(&e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        target_label = %label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed ({e}), retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt >= max_attempts {
                        error!(target_label = %label, attempts = attempt, "Giving up: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fetch()
    }
}
