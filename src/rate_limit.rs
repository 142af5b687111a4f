//! Token-bucket rate limiting: one bucket per plugin plus a global bucket.
//!
//! A refresh is admitted only when both buckets have a token. Invalid
//! configuration (zero, negative, or non-finite rates) never errors out:
//! the limiter logs a warning and falls back to a minimum positive rate of
//! one request per minute, so a bad config file degrades service instead of
//! disabling it.

use crate::error::{HostError, HostResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;

/// Fallback when a configured rate is unusable.
const MIN_RATE_PER_MINUTE: f64 = 1.0;
const MIN_BURST: f64 = 1.0;

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_minute: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            capacity: burst,
            refill_per_sec: rate_per_minute / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn put_back(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }
}

/// Clamp a configured (rate, burst) pair to usable values.
fn sanitize(rate_per_minute: f64, burst: f64, scope: &str) -> (f64, f64) {
    let mut rate = rate_per_minute;
    let mut cap = burst;
    if !rate.is_finite() || rate <= 0.0 {
        tracing::warn!(
            scope,
            configured = rate_per_minute,
            "invalid rate, falling back to minimum"
        );
        rate = MIN_RATE_PER_MINUTE;
    }
    if !cap.is_finite() || cap < 1.0 {
        tracing::warn!(
            scope,
            configured = burst,
            "invalid burst, falling back to minimum"
        );
        cap = MIN_BURST;
    }
    (rate, cap)
}

pub struct RateLimiter {
    global: Mutex<Bucket>,
    per_plugin: DashMap<String, Mutex<Bucket>>,
    plugin_rate: f64,
    plugin_burst: f64,
}

impl RateLimiter {
    pub fn new(
        global_rate_per_minute: f64,
        global_burst: f64,
        plugin_rate_per_minute: f64,
        plugin_burst: f64,
    ) -> Self {
        let (global_rate, global_cap) = sanitize(global_rate_per_minute, global_burst, "global");
        let (plugin_rate, plugin_cap) = sanitize(plugin_rate_per_minute, plugin_burst, "plugin");
        Self {
            global: Mutex::new(Bucket::new(global_rate, global_cap)),
            per_plugin: DashMap::new(),
            plugin_rate,
            plugin_burst: plugin_cap,
        }
    }

    pub fn from_config(config: &crate::config::HostConfig) -> Self {
        Self::new(
            config.global_rate_per_minute,
            config.global_burst,
            config.plugin_rate_per_minute,
            config.plugin_burst,
        )
    }

    /// Take one token from the plugin's bucket and the global bucket.
    /// Either shortage is `WouldExceed`; a consumed plugin token is put
    /// back when the global bucket is dry.
    pub fn acquire(&self, plugin_id: &str) -> HostResult<()> {
        let entry = self
            .per_plugin
            .entry(plugin_id.to_string())
            .or_insert_with(|| Mutex::new(Bucket::new(self.plugin_rate, self.plugin_burst)));

        if !entry.lock().try_take() {
            return Err(HostError::WouldExceed {
                plugin_id: plugin_id.to_string(),
            });
        }
        if !self.global.lock().try_take() {
            entry.lock().put_back();
            return Err(HostError::WouldExceed {
                plugin_id: plugin_id.to_string(),
            });
        }
        Ok(())
    }

    /// Forget a plugin's bucket (uninstall).
    pub fn remove_plugin(&self, plugin_id: &str) {
        self.per_plugin.remove(plugin_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_exhaustion() {
        let limiter = RateLimiter::new(60.0, 100.0, 60.0, 2.0);
        assert!(limiter.acquire("p").is_ok());
        assert!(limiter.acquire("p").is_ok());
        let err = limiter.acquire("p").unwrap_err();
        assert_eq!(err.code(), "WouldExceed");
    }

    #[test]
    fn plugins_have_independent_buckets() {
        let limiter = RateLimiter::new(60.0, 100.0, 60.0, 1.0);
        assert!(limiter.acquire("a").is_ok());
        assert!(limiter.acquire("a").is_err());
        assert!(limiter.acquire("b").is_ok());
    }

    #[test]
    fn global_bucket_caps_all_plugins() {
        let limiter = RateLimiter::new(60.0, 2.0, 60.0, 100.0);
        assert!(limiter.acquire("a").is_ok());
        assert!(limiter.acquire("b").is_ok());
        assert!(limiter.acquire("c").is_err());
    }

    #[test]
    fn tokens_refill_over_time() {
        // 6000/min = 100 tokens per second.
        let limiter = RateLimiter::new(6000.0, 1.0, 6000.0, 1.0);
        assert!(limiter.acquire("p").is_ok());
        assert!(limiter.acquire("p").is_err());
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(limiter.acquire("p").is_ok());
    }

    #[test]
    fn global_shortage_refunds_plugin_token() {
        let limiter = RateLimiter::new(60.0, 1.0, 60.0, 1.0);
        assert!(limiter.acquire("a").is_ok());
        // Global is dry, plugin b keeps its token for when it refills.
        assert!(limiter.acquire("b").is_err());
        let b = limiter.per_plugin.get("b").unwrap();
        assert!(b.lock().tokens >= 1.0);
    }

    #[test]
    fn invalid_rates_fall_back_to_minimum() {
        for (rate, burst) in [(0.0, 1.0), (-5.0, 1.0), (f64::NAN, 1.0), (1.0, 0.0)] {
            let limiter = RateLimiter::new(rate, burst, rate, burst);
            // Still serves exactly one request instead of erroring.
            assert!(limiter.acquire("p").is_ok(), "rate={rate} burst={burst}");
            assert!(limiter.acquire("p").is_err());
        }
    }

    #[test]
    fn remove_plugin_resets_its_bucket() {
        let limiter = RateLimiter::new(60.0, 100.0, 60.0, 1.0);
        assert!(limiter.acquire("p").is_ok());
        assert!(limiter.acquire("p").is_err());
        limiter.remove_plugin("p");
        assert!(limiter.acquire("p").is_ok());
    }
}
