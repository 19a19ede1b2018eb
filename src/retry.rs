use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Runs `operation` until it succeeds, returns an error that is not
    /// transient, or the attempt budget is spent. The operation receives the
    /// 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, job_id: &str, mut operation: F) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 1;

        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(err);
            }

            if attempt >= self.max_attempts {
                return Err(PipelineError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            warn!(
                job_id,
                attempt,
                max_attempts = self.max_attempts,
                error = %err,
                "attempt failed, will retry"
            );
            debug!(job_id, delay_ms = self.delay.as_millis() as u64, "waiting before retry");

            sleep(self.delay).await;
            attempt += 1;
        }
    }
}
