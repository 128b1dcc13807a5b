use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::RenderError;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it yields `Some`, sleeping between attempts. The
    /// token aborts pending sleeps so a torn-down caller never sees a
    /// stale attempt.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, RenderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in 1..=self.max_attempts.max(1) {
            if cancel.is_cancelled() {
                return Err(RenderError::Cancelled);
            }

            if let Some(value) = op(attempt).await {
                return Ok(value);
            }

            if attempt >= self.max_attempts {
                break;
            }

            let delay = self.delay_for(attempt);
            warn!(
                "attempt {}/{} failed, retrying in {:?}",
                attempt, self.max_attempts, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(RenderError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(RenderError::MissingContainer {
            attempts: self.max_attempts.max(1),
        })
    }
}
