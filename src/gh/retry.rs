//! Exponential backoff retry for calls against external services.
//!
//! Only transient errors are retried; everything else is returned
//! immediately. The same mechanism backs registration-token minting in
//! the starter (3 attempts, seconds apart) and backend deletes in the
//! lifecycle manager (5 retries, 1 s doubling to a 32 s cap).

use std::future::Future;
use std::time::Duration;

/// Implemented by error types that know whether a backoff-retry may help.
pub trait Retryable {
    fn is_retriable(&self) -> bool;
}

impl Retryable for super::error::GhApiError {
    fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Registration-token minting inside a starter tick: two retries
    /// (three attempts total), short delays.
    pub const REGISTRATION: Self = Self {
        max_retries: 2,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(4),
    };

    /// Backend instance deletion: 5 retries, 1 s doubling to 32 s.
    pub const BACKEND_DELETE: Self = Self {
        max_retries: 5,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(32),
    };

    /// Computes the delay for the given retry attempt (0-indexed).
    ///
    /// Doubles each attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2f64.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Executes an async operation, retrying transient failures per `config`.
///
/// Returns the first success, the first non-retriable error, or the
/// last error once retries are exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(config: RetryConfig, mut operation: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_retriable() || attempt >= config.max_retries {
                    return Err(e);
                }
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}
