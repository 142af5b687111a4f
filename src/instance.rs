//! Runtime state of a loaded plugin.
//!
//! A `PluginInstance` is created at discovery, mutated only by the plugin
//! host during state transitions or supervision callbacks, and destroyed on
//! uninstall. It is never observable partially initialised: construction
//! takes a fully validated manifest.

use crate::manifest::{DataType, PluginManifest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Artefacts
// ---------------------------------------------------------------------------

/// Usage quota snapshot produced by `usage` plugins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageData {
    pub used: f64,
    pub limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
}

/// Account balance snapshot produced by `balance` plugins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceData {
    pub amount: f64,
    pub currency: String,
}

/// Service status produced by `status` plugins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// What a plugin execution produced, typed by the manifest's `dataType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Artefact {
    Usage(UsageData),
    Balance(BalanceData),
    Status(StatusData),
    Custom(Value),
}

impl Artefact {
    /// Interpret a sandbox return value according to the declared data
    /// type. `custom` (or an undeclared type) passes the raw JSON through.
    pub fn from_value(data_type: Option<DataType>, value: Value) -> Result<Self, String> {
        match data_type {
            Some(DataType::Usage) => serde_json::from_value(value)
                .map(Artefact::Usage)
                .map_err(|e| format!("usage artefact: {e}")),
            Some(DataType::Balance) => serde_json::from_value(value)
                .map(Artefact::Balance)
                .map_err(|e| format!("balance artefact: {e}")),
            Some(DataType::Status) => serde_json::from_value(value)
                .map(Artefact::Status)
                .map_err(|e| format!("status artefact: {e}")),
            Some(DataType::Custom) | None => Ok(Artefact::Custom(value)),
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Coarse health bucket derived from the rolling counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failing,
}

/// Rolling supervision counters for one plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub total_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PluginHealth {
    pub fn record_success(&mut self, latency_ms: u64) {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.total_latency_ms += latency_ms;
        self.last_success_at = Some(Utc::now());
        self.last_error = None;
    }

    pub fn record_failure(&mut self, latency_ms: u64, error: &str) {
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.total_latency_ms += latency_ms;
        self.last_error = Some(error.to_string());
    }

    pub fn status(&self) -> HealthStatus {
        match self.consecutive_failures {
            0 => HealthStatus::Healthy,
            1 | 2 => {
                if self.success_count == 0 && self.failure_count > 0 {
                    HealthStatus::Failing
                } else {
                    HealthStatus::Degraded
                }
            }
            _ => HealthStatus::Failing,
        }
    }

    pub fn average_latency_ms(&self) -> u64 {
        let runs = self.success_count + self.failure_count;
        if runs == 0 {
            0
        } else {
            self.total_latency_ms / runs
        }
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Lifecycle state of one installed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Discovered,
    Validated,
    Enabled,
    Disabled,
}

/// Everything the host tracks about one installed plugin.
#[derive(Debug, Clone)]
pub struct PluginInstance {
    pub manifest: PluginManifest,
    pub root: PathBuf,
    pub state: PluginState,
    /// Persisted error from a failed validation or execution, surfaced to
    /// the shell instead of taking the host down.
    pub load_error: Option<String>,
    /// Last effective config handed to the sandbox.
    pub effective_config: Value,
    /// Last artefact the plugin produced.
    pub last_artefact: Option<Artefact>,
    pub health: PluginHealth,
    /// Cache keys this plugin owns, mirrored into the result cache's
    /// inverse index.
    pub cache_keys: HashSet<String>,
    /// Topics this plugin is currently subscribed to.
    pub subscriptions: HashSet<String>,
    /// Methods this plugin exposes to cross-plugin calls.
    pub exposed_methods: HashSet<String>,
    /// Repeating refresh timer, when enabled.
    pub refresh_timer: Option<u64>,
}

impl PluginInstance {
    pub fn new(manifest: PluginManifest, root: PathBuf) -> Self {
        let subscriptions = manifest.subscribed_events.iter().cloned().collect();
        let exposed_methods = manifest.exposed_methods.iter().cloned().collect();
        Self {
            manifest,
            root,
            state: PluginState::Discovered,
            load_error: None,
            effective_config: Value::Object(serde_json::Map::new()),
            last_artefact: None,
            health: PluginHealth::default(),
            cache_keys: HashSet::new(),
            subscriptions,
            exposed_methods,
            refresh_timer: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state == PluginState::Enabled
    }

    /// Summary row for the shell's plugin list.
    pub fn descriptor(&self) -> Value {
        serde_json::json!({
            "id": self.manifest.id,
            "name": self.manifest.name,
            "version": self.manifest.version,
            "pluginType": self.manifest.plugin_type,
            "dataType": self.manifest.data_type,
            "state": self.state,
            "enabled": self.is_enabled(),
            "error": self.load_error,
        })
    }
}
