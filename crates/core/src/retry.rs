use crate::error::{ErrorKind, ProxyError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential-backoff retry around a fallible async action.
///
/// Delays grow by `multiplier` from `initial_delay` up to `max_delay`; an
/// error carrying `retry_after` raises the sleep to at least that long. The
/// cancellation token short-circuits both pending sleeps and further
/// attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    /// When set, only these kinds are retried; otherwise the error's own
    /// `retryable` flag decides.
    pub retryable_kinds: Option<Vec<ErrorKind>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
            retryable_kinds: None,
        }
    }
}

impl RetryPolicy {
    fn is_retryable(&self, error: &ProxyError) -> bool {
        match &self.retryable_kinds {
            Some(kinds) => kinds.contains(&error.kind),
            None => error.retryable,
        }
    }

    /// Backoff before the attempt following `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.mul_f64(exp);
        delay.min(self.max_delay)
    }

    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut action: F,
    ) -> Result<T, ProxyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProxyError>>,
    {
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ProxyError::gateway_timeout("cancelled before attempt"));
            }

            let error = match action().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.is_retryable(&error) {
                return Err(error);
            }
            if attempt >= self.max_attempts {
                return Err(error.wrap(ErrorKind::Internal, "max retry attempts exceeded"));
            }

            let mut delay = self.delay_for_attempt(attempt);
            if self.jitter {
                delay = delay.mul_f64(0.75 + rand::random::<f64>() * 0.5);
            }
            if let Some(retry_after) = error.retry_after {
                delay = delay.max(retry_after);
            }

            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = error.kind.as_str(),
                "retrying after failure"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(error.wrap(ErrorKind::GatewayTimeout, "cancelled during retry"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
