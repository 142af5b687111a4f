//! QuotaBar plugin host core.
//!
//! Loads, verifies, sandboxes, schedules, and supervises the untrusted
//! JavaScript plugins that feed the status-bar shell with AI-service
//! usage, balance, and status data. The shell (tray, windows, renderer)
//! is a separate process; it drives this crate through [`commands`] and
//! listens on the `ipc:` event channel.

pub(crate) mod calls;
pub(crate) mod canonical_json;
pub(crate) mod commands;
pub(crate) mod config;
pub(crate) mod entry_reader;
pub(crate) mod error;
pub(crate) mod event_bus;
pub(crate) mod extract;
pub(crate) mod host_log;
pub(crate) mod instance;
pub(crate) mod integrity;
pub(crate) mod lifecycle;
pub(crate) mod manifest;
pub(crate) mod permissions;
pub(crate) mod rate_limit;
pub(crate) mod registry;
pub(crate) mod result_cache;
pub(crate) mod retry;
pub(crate) mod sandbox;
pub(crate) mod scheduler;
pub(crate) mod secure_fetch;
pub(crate) mod signature;
pub(crate) mod storage;
pub(crate) mod timers;
pub(crate) mod watcher;

// Public surface for the shell and for embedders.
pub use calls::{CallEnvelope, CallRouter, MAX_CALL_DEPTH};
pub use commands::{CommandResponse, HostCommands};
pub use config::HostConfig;
pub use error::{HostError, HostResult};
pub use event_bus::{Event, EventBus, EventHandler};
pub use host_log::{LogEntry, PluginLog};
pub use instance::{
    Artefact, BalanceData, HealthStatus, PluginHealth, PluginInstance, PluginState, StatusData,
    UsageData,
};
pub use lifecycle::PluginHost;
pub use manifest::{
    ConfigField, ConfigFieldType, ConfigSchema, DataType, PluginManifest, PluginType, API_MAJOR,
    API_MINOR,
};
pub use permissions::{PermissionChecker, PermissionGrant};
pub use rate_limit::RateLimiter;
pub use registry::{RegistryEntry, UpdateInfo};
pub use result_cache::{fingerprint, ResultCache};
pub use retry::{RetryConfig, RetryExecutor};
pub use sandbox::{ExecutionOutput, Invocation, SandboxRuntime};
pub use scheduler::{Scheduler, SchedulerStats};
pub use secure_fetch::{is_blocked_ip, FetchOptions, FetchResponse, SecureFetch};
pub use signature::{KeySource, TrustPolicy, TrustStore, OFFICIAL_KEY_ID};
pub use storage::PluginStorage;
pub use timers::{TimerCallback, TimerKind, TimerRegistry};
pub use watcher::{start_plugin_watcher, PluginWatcher};

/// Install the global tracing subscriber, honouring `QUOTABAR_LOG` (and
/// falling back to `info`). Call once from the shell's entry point.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("QUOTABAR_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
