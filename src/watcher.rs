//! Plugin directory watcher.
//!
//! Watches the plugins directory for on-disk changes and publishes the
//! affected plugin ids as a `system:plugins_changed` event, debounced so
//! an editor save or an unzip burst produces one notification. The shell
//! (or the user) decides whether to reload.

use crate::event_bus::EventBus;
use anyhow::Context as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Quiet period before a change burst is reported.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Start watching `dir` on a background thread. The thread exits when the
/// watcher is dropped, which happens when the returned handle is dropped.
pub struct PluginWatcher {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

pub fn start_plugin_watcher(dir: PathBuf, bus: Arc<EventBus>) -> anyhow::Result<PluginWatcher> {
    std::fs::create_dir_all(&dir).context("creating plugins dir")?;

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer =
        notify_debouncer_mini::new_debouncer(DEBOUNCE, tx).context("creating watcher")?;
    debouncer
        .watcher()
        .watch(&dir, notify::RecursiveMode::Recursive)
        .context("watching plugins dir")?;

    tracing::info!(dir = %dir.display(), "watching plugins directory");

    std::thread::spawn(move || {
        use notify_debouncer_mini::DebouncedEventKind;

        loop {
            match rx.recv() {
                Ok(Ok(events)) => {
                    let mut changed_ids: Vec<String> = Vec::new();
                    for event in &events {
                        if event.kind != DebouncedEventKind::Any {
                            continue;
                        }
                        // Plugin id is the first path component under the
                        // watched dir.
                        let Ok(relative) = event.path.strip_prefix(&dir) else {
                            continue;
                        };
                        let Some(first) = relative.components().next() else {
                            continue;
                        };
                        let id = first.as_os_str().to_string_lossy().to_string();
                        if !id.starts_with('.') && !changed_ids.contains(&id) {
                            changed_ids.push(id);
                        }
                    }

                    if !changed_ids.is_empty() {
                        tracing::debug!(?changed_ids, "plugin files changed");
                        let _ = bus.emit_system_sync(
                            "plugins_changed",
                            serde_json::json!({"ids": changed_ids}),
                        );
                    }
                }
                Ok(Err(e)) => tracing::warn!("watcher error: {e}"),
                Err(_) => break, // Channel closed; watcher dropped.
            }
        }
    });

    Ok(PluginWatcher {
        _debouncer: debouncer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use parking_lot::Mutex;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn file_changes_surface_as_system_events() {
        let dir = tempfile::TempDir::new().unwrap();
        let bus = Arc::new(EventBus::new(64, 4));
        bus.start_dispatcher();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&seen);
        bus.register_handler(
            "shell",
            Arc::new(move |_, payload| {
                let inner = Arc::clone(&inner);
                async move {
                    inner.lock().push(payload);
                }
                .boxed()
            }),
        )
        .await;
        bus.subscribe("shell", &["system:plugins_changed".into()]).await;

        let _watcher = start_plugin_watcher(dir.path().to_path_buf(), Arc::clone(&bus)).unwrap();
        // Give the watcher a beat to arm before mutating.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let plugin_dir = dir.path().join("usage-meter");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(plugin_dir.join("plugin.js"), "// v2").unwrap();

        let ids = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let seen = seen.lock();
                    if let Some(payload) = seen.first() {
                        break payload["ids"].clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("no change event arrived");

        let ids: Vec<String> = serde_json::from_value(ids).unwrap();
        assert!(ids.contains(&"usage-meter".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hidden_directories_are_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let bus = Arc::new(EventBus::new(64, 4));
        bus.start_dispatcher();

        let seen = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));
        let inner = Arc::clone(&seen);
        bus.register_handler(
            "shell",
            Arc::new(move |_, payload| {
                let inner = Arc::clone(&inner);
                async move {
                    inner.lock().push(payload);
                }
                .boxed()
            }),
        )
        .await;
        bus.subscribe("shell", &["system:plugins_changed".into()]).await;

        let _watcher = start_plugin_watcher(dir.path().to_path_buf(), Arc::clone(&bus)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let hidden = dir.path().join(".backups/usage-meter");
        std::fs::create_dir_all(&hidden).unwrap();
        std::fs::write(hidden.join("old.js"), "// old").unwrap();

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(seen.lock().is_empty());
    }
}
