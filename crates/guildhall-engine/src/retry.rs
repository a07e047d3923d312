use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::sink::SinkError;

/// Bounded retry with capped exponential backoff for message-sink calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single call.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy for interactive UI updates: few attempts, short waits.
    pub fn interactive() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait before attempt `failures + 1`: 1x, 2x, 4x ... the base delay,
    /// never more than `max_delay`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// One attempt bounded by the per-call timeout. A timeout is transient.
    pub async fn attempt<T, Fut>(&self, fut: Fut) -> Result<T, SinkError>
    where
        Fut: Future<Output = Result<T, SinkError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(SinkError::Transient(format!(
                "timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts,
    /// or `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, SinkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let mut failures = 0;
        loop {
            let err = match self.attempt(op()).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            failures += 1;
            if !err.is_transient() || failures >= self.attempts {
                return Err(err);
            }

            let delay = self.delay_after(failures);
            warn!(
                "{} failed ({}), attempt {}/{}, retrying in {:?}",
                what, err, failures, self.attempts, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
