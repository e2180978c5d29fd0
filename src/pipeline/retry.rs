use std::time::Duration;

use rand::Rng;

use super::provider::ProviderError;
use crate::config::PipelineSettings;

/// Bounded exponential backoff around provider calls.
///
/// Fatal errors (`Auth`, `UnsupportedInput`, `MalformedResponse`) surface at
/// once. Timeouts get at most one retry whatever the budget. No single wait
/// exceeds `max_delay`: a server asking for more ends the retries instead.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
    /// Fraction of the delay added or removed at random (0.2 = ±20%).
    pub jitter: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            factor: 2,
            jitter: 0.2,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: settings.retry_base_delay,
            max_delay: settings.retry_max_delay,
            ..Self::default()
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            factor: 2,
            jitter: 0.0,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exp = self.factor.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(exp)
    }

    /// Wait before retry number `retry`, or `None` when the server asks for
    /// longer than `max_delay`.
    fn delay_for(&self, retry: u32, err: &ProviderError) -> Option<Duration> {
        let base = self.base_delay_for(retry);
        let jittered = if self.jitter > 0.0 && !base.is_zero() {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            base.mul_f64((1.0 + spread).max(0.0))
        } else {
            base
        };
        let delay = match err {
            ProviderError::RateLimited { retry_after: Some(after) } if *after > self.max_delay => {
                return None;
            }
            ProviderError::RateLimited { retry_after: Some(after) } => jittered.max(*after),
            _ => jittered,
        };
        Some(delay.min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails fatally, or the budget is spent.
    /// `op` receives the 1-based attempt number.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Result<T, ProviderError>,
    {
        let mut attempt = 1;
        let mut timeouts = 0;
        loop {
            let err = match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if matches!(err, ProviderError::Timeout(_)) {
                timeouts += 1;
            }
            let retries_used = attempt - 1;
            let give_up = !err.is_retryable()
                || retries_used >= self.max_retries
                || (matches!(err, ProviderError::Timeout(_)) && timeouts > 1);
            if give_up {
                if attempt > 1 {
                    tracing::warn!(operation = label, attempts = attempt, kind = err.kind(), "Retries exhausted");
                }
                return Err(err);
            }

            let Some(delay) = self.delay_for(attempt, &err) else {
                tracing::warn!(operation = label, attempts = attempt, kind = err.kind(), "Retry-After beyond limit, giving up");
                return Err(err);
            };
            tracing::info!(
                operation = label,
                attempt,
                kind = err.kind(),
                delay_ms = delay.as_millis() as u64,
                "Provider call failed, retrying"
            );
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            attempt += 1;
        }
    }
}
