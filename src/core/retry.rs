// src/core/retry.rs

//! Exponential backoff for operations that fail transiently: checkpoint
//! writes and adapters reporting a retryable failure.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::error::{AdapterError, StorageError};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        StorageError::is_retryable(self)
    }
}

impl Retryable for AdapterError {
    fn is_retryable(&self) -> bool {
        AdapterError::is_retryable(self)
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Result of a retried operation along with how many attempts it took.
#[derive(Debug)]
pub struct RetryReport<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `config.max_attempts` is reached.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation_name: &str, mut operation: F) -> RetryReport<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, operation = operation_name, "Operation succeeded after retry.");
                }
                return RetryReport { result: Ok(value), attempts: attempt };
            }
            Err(err) => {
                let retryable = err.is_retryable();
                warn!(attempt, max_attempts, operation = operation_name, error = %err, retryable, "Operation failed.");
                if !retryable || attempt >= max_attempts {
                    return RetryReport { result: Err(err), attempts: attempt };
                }
                let backoff = config.calculate_backoff(attempt);
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, operation = operation_name, "Backing off before retry.");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
