//! Bounded exponential backoff around provider calls.
//!
//! The delay schedule and the retry-eligibility table are pure functions
//! of `RetryPolicy`; the actual waiting goes through a `Sleeper`, so tests
//! can record delays instead of sleeping.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::FetchError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub retryable_statuses: BTreeSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            retryable_statuses: [429, 500, 502, 503, 504].into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt + 1`:
    /// `min(max_delay, base_delay × multiplier^attempt)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        if raw.is_finite() {
            Duration::from_secs_f64(raw.clamp(0.0, max))
        } else {
            self.max_delay
        }
    }

    pub fn is_retryable(&self, err: &FetchError) -> bool {
        match err {
            FetchError::Status { status, .. } => self.retryable_statuses.contains(status),
            FetchError::Timeout { .. } | FetchError::Transport { .. } => true,
            FetchError::Decode { .. } | FetchError::Blocked { .. } => false,
        }
    }
}

// ── Sleeping ────────────────────────────────────────────────────────

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

// ── Executor ────────────────────────────────────────────────────────

pub struct RetryExecutor {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails non-retryably, or the attempt
    /// budget is spent. `op` receives the zero-based attempt number.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let attempts = self.policy.max_retries.max(1);
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.policy.is_retryable(&err) {
                debug!(endpoint = err.endpoint(), error = %err, "Non-retryable failure");
                return Err(err);
            }
            if attempt + 1 >= attempts {
                warn!(
                    endpoint = err.endpoint(),
                    attempts,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(err);
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                endpoint = err.endpoint(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retryable failure — backing off"
            );
            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}
