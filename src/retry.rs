//! Retry executor with jittered exponential backoff.
//!
//! Only error kinds explicitly classified as retryable (see
//! `HostError::is_retryable`) are retried; everything else propagates on
//! the first attempt. Configuration is validated at construction so a bad
//! retry policy fails fast instead of stalling refreshes at runtime.

use crate::error::{HostError, HostResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Uniform noise applied as `delay * (1 ± jitter_factor)`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

#[derive(Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Validate and build. Invalid configs are rejected here, never at
    /// call time.
    pub fn new(config: RetryConfig) -> HostResult<Self> {
        if config.max_attempts == 0 {
            return Err(HostError::RetryConfigError("max_attempts must be ≥ 1".into()));
        }
        if config.base_delay_ms == 0 {
            return Err(HostError::RetryConfigError("base_delay_ms must be > 0".into()));
        }
        if config.max_delay_ms < config.base_delay_ms {
            return Err(HostError::RetryConfigError(
                "max_delay_ms must be ≥ base_delay_ms".into(),
            ));
        }
        if !config.multiplier.is_finite() || config.multiplier < 1.0 {
            return Err(HostError::RetryConfigError("multiplier must be ≥ 1.0".into()));
        }
        if !config.jitter_factor.is_finite() || !(0.0..=1.0).contains(&config.jitter_factor) {
            return Err(HostError::RetryConfigError(
                "jitter_factor must be within [0, 1]".into(),
            ));
        }
        Ok(Self { config })
    }

    /// Backoff before attempt `n + 1`, given that attempt `n` (1-based)
    /// just failed: `min(max, base * multiplier^(n-1))` with `± jitter`
    /// noise, clamped on both sides.
    fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let c = &self.config;
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = (c.base_delay_ms as f64 * c.multiplier.powi(exponent)).min(c.max_delay_ms as f64);
        let spread = raw * c.jitter_factor;
        let jittered = if spread > 0.0 {
            rand::thread_rng().gen_range((raw - spread)..=(raw + spread))
        } else {
            raw
        };
        Duration::from_millis(jittered.clamp(0.0, c.max_delay_ms as f64) as u64)
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run
    /// out. The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> HostResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = HostResult<T>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.delay_after_attempt(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
