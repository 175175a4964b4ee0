// Backoff for collaborator calls: segment loads and manifest refreshes share it.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for every following one.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Spread retries by up to half of `base_delay`.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Delay slept after the failed attempt `attempt` (0-indexed). Never
    /// exceeds `max_delay`, jitter included.
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doubled = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay));

        let headroom = self.max_delay.saturating_sub(doubled);
        let spread = (self.base_delay / 2).min(headroom);
        if !self.jitter || spread.is_zero() {
            return doubled;
        }
        doubled + spread.mul_f64(rand::rng().random_range(0.0..1.0))
    }
}

/// Outcome of one attempt.
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure, try again after the backoff delay.
    Retry(EngineError),
    /// Permanent failure, give up now.
    Fail(EngineError),
}

impl<T> RetryAction<T> {
    /// Sorts a collaborator result by [`EngineError::is_retryable`].
    pub fn classify(result: Result<T, EngineError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_retryable() => Self::Retry(err),
            Err(err) => Self::Fail(err),
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently or runs out of
/// retries. The closure gets the 0-indexed attempt number. Cancelling
/// `token` interrupts the backoff sleep with [`EngineError::Cancelled`].
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, EngineError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) if attempt >= policy.max_retries => return Err(err),
            RetryAction::Retry(err) => err,
        };

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        warn!(
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, backing off"
        );
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(EngineError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
