//! Command surface the desktop shell binds to its IPC layer.
//!
//! Every command returns the same `{success, data?, error?}` envelope so
//! the shell can route failures uniformly; errors carry the stable code
//! from the host taxonomy. The commands are thin: all semantics live in
//! the host, this layer only adapts shapes.

use crate::error::{HostError, HostResult};
use crate::lifecycle::PluginHost;
use crate::registry;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

/// Uniform command envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl CommandResponse {
    fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(error: HostError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(json!({
                "code": error.code(),
                "message": error.to_string(),
            })),
        }
    }
}

fn envelope(result: HostResult<Value>) -> CommandResponse {
    match result {
        Ok(data) => CommandResponse::ok(data),
        Err(error) => CommandResponse::err(error),
    }
}

/// The shell-facing command set over one host.
#[derive(Clone)]
pub struct HostCommands {
    host: Arc<PluginHost>,
}

impl HostCommands {
    pub fn new(host: Arc<PluginHost>) -> Self {
        Self { host }
    }

    // -- management ---------------------------------------------------------

    pub fn plugin_list(&self) -> CommandResponse {
        CommandResponse::ok(Value::Array(self.host.list()))
    }

    pub async fn plugin_enable(&self, plugin_id: &str) -> CommandResponse {
        envelope(
            self.host
                .enable(plugin_id)
                .await
                .map(|()| json!({"id": plugin_id})),
        )
    }

    pub async fn plugin_disable(&self, plugin_id: &str) -> CommandResponse {
        envelope(
            self.host
                .disable(plugin_id)
                .await
                .map(|()| json!({"id": plugin_id})),
        )
    }

    pub async fn plugin_install(&self, archive_path: &str) -> CommandResponse {
        envelope(
            self.host
                .install(Path::new(archive_path))
                .await
                .map(|id| json!({"id": id})),
        )
    }

    pub async fn plugin_uninstall(&self, plugin_id: &str) -> CommandResponse {
        envelope(
            self.host
                .uninstall(plugin_id)
                .await
                .map(|()| json!({"id": plugin_id})),
        )
    }

    pub async fn plugin_reload(&self, plugin_id: &str) -> CommandResponse {
        envelope(
            self.host
                .reload(plugin_id)
                .await
                .map(|()| json!({"id": plugin_id})),
        )
    }

    pub async fn plugin_check_updates(&self) -> CommandResponse {
        let result = async {
            let entries = registry::fetch_registry().await?;
            let updates = registry::available_updates(&entries, &self.host.installed_versions());
            serde_json::to_value(updates).map_err(|e| HostError::ManifestParse(e.to_string()))
        }
        .await;
        envelope(result)
    }

    /// Update from a local archive when `archive_path` is given, else
    /// resolve and download through the registry.
    pub async fn plugin_update(
        &self,
        plugin_id: &str,
        archive_path: Option<&str>,
    ) -> CommandResponse {
        let result = async {
            let archive = match archive_path {
                Some(path) => std::path::PathBuf::from(path),
                None => {
                    let entries = registry::fetch_registry().await?;
                    let updates =
                        registry::available_updates(&entries, &self.host.installed_versions());
                    let update = updates
                        .into_iter()
                        .find(|u| u.id == plugin_id)
                        .ok_or_else(|| {
                            HostError::UnknownPlugin(format!("no update available for {plugin_id}"))
                        })?;
                    let staging = std::env::temp_dir().join("quotabar-updates");
                    registry::download_archive(&update.download_url, &staging).await?
                }
            };
            self.host.update(plugin_id, &archive).await?;
            Ok(json!({"id": plugin_id}))
        }
        .await;
        envelope(result)
    }

    pub async fn plugin_rollback(&self, plugin_id: &str) -> CommandResponse {
        envelope(
            self.host
                .rollback(plugin_id)
                .await
                .map(|()| json!({"id": plugin_id})),
        )
    }

    // -- data ---------------------------------------------------------------

    pub fn get_all_data(&self) -> CommandResponse {
        CommandResponse::ok(self.host.get_all_data())
    }

    pub fn get_plugin_data(&self, plugin_id: &str) -> CommandResponse {
        envelope(self.host.get_plugin_data(plugin_id).map(|artefact| {
            artefact
                .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
                .unwrap_or(Value::Null)
        }))
    }

    pub async fn refresh_plugin(&self, plugin_id: &str) -> CommandResponse {
        envelope(
            self.host
                .refresh_plugin(plugin_id)
                .await
                .map(|artefact| serde_json::to_value(artefact).unwrap_or(Value::Null)),
        )
    }

    pub async fn refresh_all(&self) -> CommandResponse {
        let outcomes = self.host.refresh_all().await;
        let mut map = serde_json::Map::new();
        for (id, outcome) in outcomes {
            let row = match outcome {
                Ok(artefact) => json!({
                    "success": true,
                    "data": serde_json::to_value(artefact).unwrap_or(Value::Null),
                }),
                Err(e) => json!({
                    "success": false,
                    "error": {"code": e.code(), "message": e.to_string()},
                }),
            };
            map.insert(id, row);
        }
        CommandResponse::ok(Value::Object(map))
    }

    // -- config -------------------------------------------------------------

    pub fn get_plugin_config(&self, plugin_id: &str) -> CommandResponse {
        envelope(self.host.get_plugin_config(plugin_id))
    }

    pub async fn set_plugin_config(&self, plugin_id: &str, config: Value) -> CommandResponse {
        envelope(
            self.host
                .set_plugin_config(plugin_id, config)
                .await
                .map(|()| json!({"id": plugin_id})),
        )
    }

    pub fn validate_plugin_config(&self, plugin_id: &str, config: &Value) -> CommandResponse {
        match self.host.validate_plugin_config(plugin_id, config) {
            Ok(()) => CommandResponse::ok(json!({"valid": true})),
            // Validation problems are data, not command failures.
            Err(e @ HostError::ConfigInvalid(_)) => CommandResponse::ok(json!({
                "valid": false,
                "message": e.to_string(),
            })),
            Err(other) => CommandResponse::err(other),
        }
    }

    // -- health -------------------------------------------------------------

    pub fn get_all_health(&self) -> CommandResponse {
        CommandResponse::ok(self.host.get_all_health())
    }

    pub fn get_plugin_health(&self, plugin_id: &str) -> CommandResponse {
        envelope(self.host.get_plugin_health(plugin_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::lifecycle::write_test_plugin;
    use crate::signature::TrustStore;

    const PLUGIN_JS: &str = "module.exports.default = () => ({ used: 2, limit: 4 });";

    async fn commands(dir: &Path) -> HostCommands {
        let mut config = HostConfig::default();
        config.global_rate_per_minute = 10_000.0;
        config.global_burst = 1_000.0;
        config.plugin_rate_per_minute = 10_000.0;
        config.plugin_burst = 1_000.0;
        let host = PluginHost::new(config, dir.to_path_buf(), TrustStore::embedded_only());
        host.init().await.unwrap();
        HostCommands::new(host)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn list_enable_refresh_flow() {
        let dir = tempfile::TempDir::new().unwrap();
        write_test_plugin(dir.path(), "usage-meter", PLUGIN_JS);
        let commands = commands(dir.path()).await;

        let list = commands.plugin_list();
        assert!(list.success);
        assert_eq!(list.data.unwrap()[0]["id"], "usage-meter");

        let enabled = commands.plugin_enable("usage-meter").await;
        assert!(enabled.success);

        let refreshed = commands.refresh_plugin("usage-meter").await;
        assert!(refreshed.success);
        let data = refreshed.data.unwrap();
        assert_eq!(data["kind"], "usage");
        assert_eq!(data["data"]["used"], json!(2.0));

        let all = commands.get_all_data();
        assert!(all.success);
        assert!(all.data.unwrap().get("usage-meter").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn errors_carry_stable_codes() {
        let dir = tempfile::TempDir::new().unwrap();
        let commands = commands(dir.path()).await;

        let missing = commands.plugin_enable("ghost").await;
        assert!(!missing.success);
        assert_eq!(missing.error.as_ref().unwrap()["code"], "UnknownPlugin");

        let missing = commands.get_plugin_health("ghost");
        assert_eq!(missing.error.unwrap()["code"], "UnknownPlugin");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refresh_all_collects_per_plugin_outcomes() {
        let dir = tempfile::TempDir::new().unwrap();
        write_test_plugin(dir.path(), "good-plugin", PLUGIN_JS);
        write_test_plugin(
            dir.path(),
            "bad-plugin",
            r#"module.exports.default = () => { throw new PluginError("down"); };"#,
        );
        let commands = commands(dir.path()).await;
        commands.plugin_enable("good-plugin").await;
        commands.plugin_enable("bad-plugin").await;

        let all = commands.refresh_all().await;
        assert!(all.success);
        let data = all.data.unwrap();
        assert_eq!(data["good-plugin"]["success"], json!(true));
        assert_eq!(data["bad-plugin"]["success"], json!(false));
        assert_eq!(data["bad-plugin"]["error"]["code"], "JsException");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn config_validation_is_data_not_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        write_test_plugin(dir.path(), "usage-meter", PLUGIN_JS);
        let commands = commands(dir.path()).await;

        // No schema declared: any object validates.
        let valid = commands.validate_plugin_config("usage-meter", &json!({"x": 1}));
        assert!(valid.success);
        assert_eq!(valid.data.unwrap()["valid"], json!(true));

        let invalid = commands.validate_plugin_config("usage-meter", &json!("not an object"));
        assert!(invalid.success);
        assert_eq!(invalid.data.unwrap()["valid"], json!(false));

        let unknown = commands.validate_plugin_config("ghost", &json!({}));
        assert!(!unknown.success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn uninstall_through_commands() {
        let dir = tempfile::TempDir::new().unwrap();
        write_test_plugin(dir.path(), "usage-meter", PLUGIN_JS);
        let commands = commands(dir.path()).await;

        assert!(commands.plugin_uninstall("usage-meter").await.success);
        assert!(commands.plugin_list().data.unwrap().as_array().unwrap().is_empty());
        assert!(!dir.path().join("usage-meter").exists());
    }

    #[test]
    fn envelope_serialisation() {
        let ok = CommandResponse::ok(json!({"id": "x"}));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value, json!({"success": true, "data": {"id": "x"}}));

        let err = CommandResponse::err(HostError::Timeout);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"]["code"], "Timeout");
    }
}
