//! Bounded retry with fixed backoff and a per-call timeout

use crate::error::QueryError;
use log::debug;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub attempts: u32,
    pub backoff: Duration,
    /// Applied to every attempt individually
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(3),
        }
    }
}

/// The last error seen and how many attempts were spent on it
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: QueryError,
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. Timeouts count as transient failures.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let max_attempts = self.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(QueryError::Timeout(self.timeout)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    debug!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        what, attempt, max_attempts, error, self.backoff
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(error) => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    })
                }
            }
        }
    }
}
