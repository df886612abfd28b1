//! Retry wrapper for flaky operations.
//!
//! `Retry` re-invokes the inner operation when it returns an error, up to
//! `RetryConfig::max_attempts` attempts in total, sleeping per the configured
//! backoff between attempts. A pause is a normal outcome and is never retried.

use std::future::Future;

use serde_json::Value;
use tracing::{debug, warn};
use trellis_types::config::RetryConfig;

use super::{Operation, OperationError, OperationOutcome};

/// Wraps an operation with a retry policy.
///
/// ```ignore
/// registry.register("http.fetch", Retry::new(HttpFetch::default(), RetryConfig::default()));
/// ```
pub struct Retry<O> {
    inner: O,
    config: RetryConfig,
}

impl<O> Retry<O> {
    pub fn new(inner: O, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether a failed attempt (1-based) should be followed by another.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.config.max_attempts
    }
}

impl<O: Operation> Operation for Retry<O> {
    fn call(
        &self,
        input: Value,
    ) -> impl Future<Output = Result<OperationOutcome, OperationError>> + Send {
        async move {
            let mut attempt = 1;
            loop {
                match self.inner.call(input.clone()).await {
                    Ok(outcome) => {
                        if attempt > 1 {
                            debug!(attempt, "operation succeeded after retry");
                        }
                        return Ok(outcome);
                    }
                    Err(e) if self.should_retry(attempt) => {
                        let delay = self.config.backoff.delay(attempt);
                        warn!(
                            attempt,
                            max_attempts = self.config.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "operation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
