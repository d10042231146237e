use std::future::Future;
use std::time::{Duration, Instant};

use crate::config::RetrySettings;
use crate::{GatewayError, Result};

const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Bounded exponential backoff over an idempotent attempt. The predicate
/// is [`GatewayError::is_retryable`]; everything else is terminal on the
/// first occurrence.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    wait_min: Duration,
    wait_max: Duration,
    total_budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            wait_min: settings.wait_min,
            wait_max: settings.wait_max,
            total_budget: settings.total_budget,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_wait_bounds(mut self, wait_min: Duration, wait_max: Duration) -> Self {
        self.wait_min = wait_min;
        self.wait_max = wait_max;
        self
    }

    pub fn with_total_budget(mut self, total_budget: Duration) -> Self {
        self.total_budget = total_budget;
        self
    }

    /// Wait before attempt `completed + 1`, given `completed` failures so
    /// far: `clamp(1s * 2^(completed-1), wait_min, wait_max)`.
    pub fn backoff_delay(&self, completed_attempts: u32) -> Duration {
        let exponent = completed_attempts.saturating_sub(1).min(20);
        let raw = BACKOFF_BASE.saturating_mul(1u32 << exponent);
        raw.clamp(self.wait_min, self.wait_max)
    }

    /// Drive `attempt` until it succeeds, turns terminal, or the attempt
    /// and wall-clock budgets run out. Caller cancellation propagates by
    /// dropping the returned future mid-sleep or mid-attempt.
    pub async fn run<F, Fut, T>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut completed = 0u32;

        loop {
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            completed += 1;

            if !err.is_retryable() || completed >= self.max_attempts {
                return Err(err);
            }

            let delay = self.backoff_delay(completed);
            if started.elapsed().saturating_add(delay) > self.total_budget {
                tracing::debug!(
                    attempts = completed,
                    "retry window exhausted; surfacing last error"
                );
                return Err(err);
            }

            tracing::debug!(
                attempt = completed,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying upstream request"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
