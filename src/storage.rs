//! Sandboxed per-plugin storage.
//!
//! Each plugin owns `{plugins_dir}/{id}/data/`; nothing a plugin stores can
//! land outside it. The `storage` capability exposes a small key-value
//! surface over this directory, and the host itself keeps the plugin's
//! persisted config here.

use crate::error::{HostError, HostResult};
use crate::manifest::is_path_escape;
use serde_json::Value;
use std::path::PathBuf;

lazy_static::lazy_static! {
    static ref KV_KEY: regex::Regex = regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap();
}

/// File the host persists plugin config into, inside the data dir.
const CONFIG_FILE: &str = "config.json";

#[derive(Clone)]
pub struct PluginStorage {
    root: PathBuf,
}

impl PluginStorage {
    /// `root` is the plugins directory; per-plugin data lives beneath it.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn data_dir(&self, plugin_id: &str) -> HostResult<PathBuf> {
        if plugin_id.is_empty() || is_path_escape(plugin_id) {
            return Err(HostError::PathTraversal(plugin_id.to_string()));
        }
        Ok(self.root.join(plugin_id).join("data"))
    }

    /// Resolve and validate a path within a plugin's data directory.
    fn resolve(&self, plugin_id: &str, relative: &str) -> HostResult<PathBuf> {
        if relative.is_empty() || is_path_escape(relative) {
            return Err(HostError::PathTraversal(relative.to_string()));
        }
        Ok(self.data_dir(plugin_id)?.join(relative))
    }

    // -- raw file surface ---------------------------------------------------

    pub fn read(&self, plugin_id: &str, path: &str) -> HostResult<Option<String>> {
        let file_path = self.resolve(plugin_id, path)?;
        match std::fs::read_to_string(&file_path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HostError::Io(e)),
        }
    }

    pub fn write(&self, plugin_id: &str, path: &str, content: &str) -> HostResult<()> {
        let file_path = self.resolve(plugin_id, path)?;
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&file_path, content)?;
        Ok(())
    }

    pub fn delete(&self, plugin_id: &str, path: &str) -> HostResult<()> {
        let file_path = self.resolve(plugin_id, path)?;
        match std::fs::remove_file(&file_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HostError::Io(e)),
        }
    }

    /// Remove everything a plugin stored. Used by uninstall.
    pub fn clear_plugin(&self, plugin_id: &str) -> HostResult<()> {
        let dir = self.data_dir(plugin_id)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HostError::Io(e)),
        }
    }

    // -- key-value surface for the sandbox ----------------------------------

    fn kv_path(key: &str) -> HostResult<String> {
        if !KV_KEY.is_match(key) {
            return Err(HostError::PathTraversal(key.to_string()));
        }
        Ok(format!("kv/{key}.json"))
    }

    pub fn kv_get(&self, plugin_id: &str, key: &str) -> HostResult<Option<Value>> {
        let path = Self::kv_path(key)?;
        match self.read(plugin_id, &path)? {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| HostError::ConfigInvalid(format!("stored value for {key}: {e}"))),
            None => Ok(None),
        }
    }

    pub fn kv_set(&self, plugin_id: &str, key: &str, value: &Value) -> HostResult<()> {
        let path = Self::kv_path(key)?;
        self.write(plugin_id, &path, &value.to_string())
    }

    pub fn kv_remove(&self, plugin_id: &str, key: &str) -> HostResult<()> {
        let path = Self::kv_path(key)?;
        self.delete(plugin_id, &path)
    }

    // -- host-persisted plugin config ---------------------------------------

    pub fn read_config(&self, plugin_id: &str) -> HostResult<Option<Value>> {
        match self.read(plugin_id, CONFIG_FILE)? {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| HostError::ConfigInvalid(format!("persisted config: {e}"))),
            None => Ok(None),
        }
    }

    pub fn write_config(&self, plugin_id: &str, config: &Value) -> HostResult<()> {
        self.write(plugin_id, CONFIG_FILE, &config.to_string())
    }
}

/// Storage rooted at the production plugins directory.
impl Default for PluginStorage {
    fn default() -> Self {
        Self::new(crate::config::plugins_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage() -> (PluginStorage, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        (PluginStorage::new(dir.path().to_path_buf()), dir)
    }

    #[test]
    fn write_read_delete_round_trip() {
        let (storage, _dir) = storage();
        storage.write("p", "cache.json", "{\"a\":1}").unwrap();
        assert_eq!(
            storage.read("p", "cache.json").unwrap(),
            Some("{\"a\":1}".to_string())
        );
        storage.delete("p", "cache.json").unwrap();
        assert_eq!(storage.read("p", "cache.json").unwrap(), None);
    }

    #[test]
    fn missing_file_reads_none_and_delete_is_idempotent() {
        let (storage, _dir) = storage();
        assert_eq!(storage.read("p", "absent.json").unwrap(), None);
        assert!(storage.delete("p", "absent.json").is_ok());
    }

    #[test]
    fn paths_are_confined_to_data_dir() {
        let (storage, dir) = storage();
        storage.write("p", "nested/deep.json", "x").unwrap();
        assert!(dir.path().join("p/data/nested/deep.json").is_file());

        for (id, path) in [
            ("p", "../outside.json"),
            ("p", "/etc/passwd"),
            ("p", ""),
            ("../p", "f.json"),
            ("", "f.json"),
        ] {
            let err = storage.write(id, path, "x").unwrap_err();
            assert_eq!(err.code(), "PathTraversal", "{id:?}/{path:?}");
        }
    }

    #[test]
    fn kv_surface_round_trips_json() {
        let (storage, _dir) = storage();
        storage.kv_set("p", "last-sync", &json!({"at": 123})).unwrap();
        assert_eq!(
            storage.kv_get("p", "last-sync").unwrap(),
            Some(json!({"at": 123}))
        );
        storage.kv_remove("p", "last-sync").unwrap();
        assert_eq!(storage.kv_get("p", "last-sync").unwrap(), None);
    }

    #[test]
    fn kv_keys_are_validated() {
        let (storage, _dir) = storage();
        for key in ["../escape", "a/b", "", ".hidden"] {
            assert!(storage.kv_set("p", key, &json!(1)).is_err(), "{key:?}");
        }
        assert!(storage.kv_set("p", "ok_key-1.v2", &json!(1)).is_ok());
    }

    #[test]
    fn config_persistence_round_trips() {
        let (storage, _dir) = storage();
        assert_eq!(storage.read_config("p").unwrap(), None);
        storage.write_config("p", &json!({"threshold": 80})).unwrap();
        assert_eq!(
            storage.read_config("p").unwrap(),
            Some(json!({"threshold": 80}))
        );
    }

    #[test]
    fn clear_plugin_removes_everything() {
        let (storage, dir) = storage();
        storage.write("p", "a.json", "1").unwrap();
        storage.kv_set("p", "k", &json!(2)).unwrap();
        storage.clear_plugin("p").unwrap();
        assert!(!dir.path().join("p/data").exists());
        // Idempotent.
        assert!(storage.clear_plugin("p").is_ok());
    }
}
