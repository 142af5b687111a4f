//! Shared store of recent plugin log output.
//!
//! Sandbox `console.*` and `context.log` land here; the shell reads the
//! tail for its diagnostics panel, usually filtered to one plugin. The
//! store keeps a bounded window of the newest entries and mirrors each
//! line to `tracing` so host logs carry plugin context too.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// How many log lines survive across all plugins.
pub(crate) const LOG_WINDOW: usize = 1000;

/// A single retained log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp_ms: i64,
    pub level: String,
    pub plugin_id: String,
    pub message: String,
}

/// Bounded window of log lines. Appends evict from the front once the
/// window is full; reads walk backwards from the newest entry, which
/// matches how the shell queries ("last N lines of plugin X").
struct LogWindow {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    /// Ids keep increasing across evictions so the shell can detect gaps.
    next_id: u64,
}

impl LogWindow {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    fn record(&mut self, level: String, plugin_id: String, message: String) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            level,
            plugin_id,
            message,
        });
        id
    }

    /// Up to `limit` newest entries matching the filter, returned oldest
    /// first. Scans from the tail so a busy host does not pay for the
    /// whole window on every query.
    fn tail(&self, plugin_id: Option<&str>, limit: usize) -> Vec<LogEntry> {
        let mut picked: Vec<LogEntry> = self
            .entries
            .iter()
            .rev()
            .filter(|e| plugin_id.is_none_or(|id| e.plugin_id == id))
            .take(limit)
            .cloned()
            .collect();
        picked.reverse();
        picked
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the host's plugin log store.
#[derive(Clone)]
pub struct PluginLog {
    window: Arc<Mutex<LogWindow>>,
}

impl Default for PluginLog {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginLog {
    pub fn new() -> Self {
        Self::with_capacity(LOG_WINDOW)
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            window: Arc::new(Mutex::new(LogWindow::new(capacity))),
        }
    }

    /// Record a log line for a plugin. Returns the assigned entry id.
    pub fn push(&self, level: &str, plugin_id: &str, message: &str) -> u64 {
        match level {
            "error" => tracing::error!(plugin = plugin_id, "{message}"),
            "warn" => tracing::warn!(plugin = plugin_id, "{message}"),
            _ => tracing::info!(plugin = plugin_id, "{message}"),
        }
        self.window
            .lock()
            .record(level.to_string(), plugin_id.to_string(), message.to_string())
    }

    /// Most recent entries, oldest first, optionally filtered by plugin.
    pub fn recent(&self, plugin_id: Option<&str>, limit: usize) -> Vec<LogEntry> {
        self.window.lock().tail(plugin_id, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_assigns_monotonic_ids() {
        let log = PluginLog::new();
        let a = log.push("info", "p1", "first");
        let b = log.push("warn", "p1", "second");
        assert!(b > a);
    }

    #[test]
    fn recent_returns_in_order() {
        let log = PluginLog::new();
        log.push("info", "p1", "one");
        log.push("info", "p2", "two");
        log.push("error", "p1", "three");

        let all = log.recent(None, 10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "one");
        assert_eq!(all[2].message, "three");
        assert_eq!(all[2].level, "error");
    }

    #[test]
    fn recent_filters_by_plugin() {
        let log = PluginLog::new();
        log.push("info", "p1", "one");
        log.push("info", "p2", "two");
        log.push("info", "p1", "three");

        let p2 = log.recent(Some("p2"), 10);
        assert_eq!(p2.len(), 1);
        assert_eq!(p2[0].message, "two");
    }

    #[test]
    fn window_evicts_oldest_but_ids_keep_growing() {
        let log = PluginLog::with_capacity(3);
        for i in 0..5 {
            log.push("info", "p", &format!("m{i}"));
        }
        let kept = log.recent(None, 10);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].message, "m2");
        assert_eq!(kept[2].message, "m4");
        assert_eq!(kept[2].id, 5);
    }

    #[test]
    fn limit_takes_the_newest_entries() {
        let log = PluginLog::new();
        for i in 0..10 {
            log.push("info", "p", &format!("m{i}"));
        }
        let tail = log.recent(None, 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "m8");
        assert_eq!(tail[1].message, "m9");
    }

    #[test]
    fn filtered_limit_counts_only_matches() {
        let log = PluginLog::with_capacity(8);
        for i in 0..4 {
            log.push("info", "a", &format!("a{i}"));
            log.push("info", "b", &format!("b{i}"));
        }
        let tail = log.recent(Some("a"), 2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "a2");
        assert_eq!(tail[1].message, "a3");
    }
}
