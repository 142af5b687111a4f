//! Host configuration and filesystem layout.
//!
//! All tunables live in [`HostConfig`] with serde defaults so a partial
//! config file deserialises into a complete value. Paths follow the
//! platform config directory convention.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Get the config directory using the platform-appropriate location.
///
/// - macOS: `~/Library/Application Support/quotabar/`
/// - Linux: `~/.config/quotabar/` (or `$XDG_CONFIG_HOME`)
/// - Windows: `%APPDATA%/quotabar/`
///
/// Falls back to `~/.quotabar/` if the platform dir is unavailable.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("quotabar"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".quotabar")
        })
}

/// Root directory for installed plugins: `{config_dir}/plugins/`
pub fn plugins_dir() -> PathBuf {
    config_dir().join("plugins")
}

/// User-imported trusted signing keys: `{config_dir}/trusted_keys.json`
pub fn trusted_keys_path() -> PathBuf {
    config_dir().join("trusted_keys.json")
}

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Host-wide tunables. Every field has a default so the shell can ship an
/// empty config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    /// Maximum concurrent plugin HTTP requests, process-wide.
    pub max_in_flight_fetches: usize,
    /// Wall-clock limit for a single plugin HTTP request, seconds.
    pub fetch_timeout_secs: u64,
    /// Streamed response-size cap per request, bytes.
    pub max_response_bytes: u64,
    /// DNS resolution timeout, seconds.
    pub dns_timeout_secs: u64,

    /// Sandbox memory ceiling per invocation, bytes.
    pub sandbox_memory_limit: usize,
    /// Sandbox stack ceiling per invocation, bytes.
    pub sandbox_stack_limit: usize,
    /// Sandbox wall-clock limit per invocation, milliseconds.
    pub sandbox_timeout_ms: u64,

    /// Scheduler queue capacity.
    pub scheduler_queue_capacity: usize,
    /// Scheduler worker permits.
    pub scheduler_permits: usize,
    /// Per-task timeout during shutdown drain, milliseconds.
    pub scheduler_drain_timeout_ms: u64,

    /// Global rate limit, requests per minute.
    pub global_rate_per_minute: f64,
    /// Global burst size.
    pub global_burst: f64,
    /// Per-plugin rate limit, requests per minute.
    pub plugin_rate_per_minute: f64,
    /// Per-plugin burst size.
    pub plugin_burst: f64,

    /// Result cache capacity, entries.
    pub cache_capacity: usize,
    /// Default cache TTL, seconds.
    pub cache_ttl_secs: u64,

    /// Event queue depth before emit starts failing.
    pub event_queue_capacity: usize,
    /// Maximum handlers dispatched concurrently for one event.
    pub max_concurrent_handlers: usize,

    /// Interval between scheduled plugin refreshes, seconds.
    pub refresh_interval_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_in_flight_fetches: 32,
            fetch_timeout_secs: 30,
            max_response_bytes: 5 * 1024 * 1024,
            dns_timeout_secs: 5,
            sandbox_memory_limit: 64 * 1024 * 1024,
            sandbox_stack_limit: 512 * 1024,
            sandbox_timeout_ms: 5_000,
            scheduler_queue_capacity: 64,
            scheduler_permits: 4,
            scheduler_drain_timeout_ms: 5_000,
            global_rate_per_minute: 60.0,
            global_burst: 10.0,
            plugin_rate_per_minute: 30.0,
            plugin_burst: 5.0,
            cache_capacity: 256,
            cache_ttl_secs: 60,
            event_queue_capacity: 256,
            max_concurrent_handlers: 8,
            refresh_interval_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = HostConfig::default();
        assert_eq!(c.max_in_flight_fetches, 32);
        assert_eq!(c.max_response_bytes, 5 * 1024 * 1024);
        assert!(c.global_rate_per_minute > 0.0);
        assert!(c.scheduler_permits <= c.scheduler_queue_capacity);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let c: HostConfig = serde_json::from_str(r#"{"fetchTimeoutSecs": 10}"#).unwrap();
        assert_eq!(c.fetch_timeout_secs, 10);
        assert_eq!(c.scheduler_queue_capacity, 64);
    }

    #[test]
    fn paths_nest_under_config_dir() {
        assert!(plugins_dir().starts_with(config_dir()));
        assert!(trusted_keys_path().starts_with(config_dir()));
    }
}
