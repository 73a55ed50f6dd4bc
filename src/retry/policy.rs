//! Explicit retry policy: attempt budget and backoff computation.
//!
//! Both the immediate retry passes inside a batch and the background
//! queue apply this policy, so there is exactly one definition of "how
//! long to wait before pass n".

use std::time::Duration;

use rand::RngExt;

use crate::config::DispatchConfig;

/// Retry policy: attempt budget plus exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional passes over the still-failing subset after the first.
    pub max_retries: u32,
    base: Duration,
    multiplier: f64,
    cap: Duration,
    max_jitter: Duration,
}

impl RetryPolicy {
    /// Creates a policy with an explicit budget and backoff shape.
    pub fn new(
        max_retries: u32,
        base: Duration,
        multiplier: f64,
        cap: Duration,
        max_jitter: Duration,
    ) -> Self {
        Self {
            max_retries,
            base,
            multiplier,
            cap,
            max_jitter,
        }
    }

    /// Policy for immediate in-batch retries, from configuration.
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            config.max_immediate_retries,
            config.backoff_base,
            config.backoff_multiplier,
            config.backoff_cap,
            config.backoff_max_jitter,
        )
    }

    /// Deterministic part of the delay before retry pass `attempt`
    /// (1-based): `min(base * multiplier^(attempt-1), cap)`.
    ///
    /// Monotonically non-decreasing in `attempt` up to the cap.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let raw_ms = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap_ms = self.cap.as_millis() as f64;

        let delay_ms = if raw_ms.is_finite() {
            raw_ms.min(cap_ms)
        } else {
            cap_ms
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Full delay before retry pass `attempt`: the deterministic backoff
    /// plus uniform random jitter in `[0, max_jitter]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base_delay(attempt);
        }
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        self.base_delay(attempt) + jitter
    }

    /// Whether pass `attempt` (1-based, counting retries only) is within
    /// the budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}
