//! Plugin manifest parsing and validation.
//!
//! Every installed plugin ships a `manifest.json` declaring its identity,
//! entry file, capability permissions, and the SHA-256 of every file it
//! installs. Parsing is strict: an invalid manifest is rejected before any
//! plugin code is looked at.

use crate::error::{HostError, HostResult};
use crate::permissions;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Component, Path};

/// Api major version this runtime implements.
pub const API_MAJOR: u32 = 1;
/// Highest api minor version this runtime implements. Plugins may declare
/// `{API_MAJOR}.0` through `{API_MAJOR}.{API_MINOR}`.
pub const API_MINOR: u32 = 1;

lazy_static::lazy_static! {
    static ref KEBAB_ID: regex::Regex =
        regex::Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap();
    static ref SEMVER: regex::Regex =
        regex::Regex::new(r"^\d+\.\d+\.\d+$").unwrap();
    static ref API_VERSION: regex::Regex =
        regex::Regex::new(r"^(\d+)\.(\d+)$").unwrap();
    static ref SHA256_REF: regex::Regex =
        regex::Regex::new(r"^sha256:[0-9a-fA-F]{64}$").unwrap();
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How the host drives a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// Produces an artefact on every refresh cycle.
    Data,
    /// Runs on events and timers only; no periodic artefact.
    Background,
}

/// Artefact kind a data plugin produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Usage,
    Balance,
    Status,
    Custom,
}

/// Field types a plugin config schema may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFieldType {
    String,
    Number,
    Boolean,
    Select,
}

/// One field in a plugin's declared config schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigField {
    #[serde(rename = "type")]
    pub field_type: ConfigFieldType,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    /// Valid choices for `select` fields.
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// Declared config schema: field name → field description.
pub type ConfigSchema = BTreeMap<String, ConfigField>;

/// Plugin manifest as declared in `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub api_version: String,
    pub plugin_type: PluginType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    pub entry: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub exposed_methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<ConfigSchema>,
    #[serde(default)]
    pub subscribed_events: Vec<String>,
    /// Relative path → `"sha256:<hex>"` for every installed file.
    pub files: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

// ---------------------------------------------------------------------------
// Path safety
// ---------------------------------------------------------------------------

/// Returns true if a relative path attempts to escape its root via `..`,
/// absolute components, or other shenanigans.
pub(crate) fn is_path_escape(relative: &str) -> bool {
    let path = Path::new(relative);

    if path.is_absolute() {
        return true;
    }

    for component in path.components() {
        match component {
            Component::ParentDir => return true,
            Component::RootDir | Component::Prefix(_) => return true,
            _ => {}
        }
    }

    false
}

// ---------------------------------------------------------------------------
// Parsing & validation
// ---------------------------------------------------------------------------

/// Parse and validate a manifest from its JSON text.
pub fn parse_manifest(json: &str) -> HostResult<PluginManifest> {
    let manifest: PluginManifest =
        serde_json::from_str(json).map_err(|e| HostError::ManifestParse(e.to_string()))?;
    manifest.validate()?;
    Ok(manifest)
}

impl PluginManifest {
    /// Check every declared invariant. Called on parse and again before any
    /// state transition that consumes a manifest.
    pub fn validate(&self) -> HostResult<()> {
        if !KEBAB_ID.is_match(&self.id) {
            return Err(HostError::ManifestInvariant(format!(
                "id \"{}\" is not kebab-case",
                self.id
            )));
        }
        if self.name.is_empty() {
            return Err(HostError::ManifestInvariant("name is empty".into()));
        }
        if !SEMVER.is_match(&self.version) {
            return Err(HostError::ManifestInvariant(format!(
                "version \"{}\" is not semver",
                self.version
            )));
        }
        self.check_api_version()?;

        if self.entry.is_empty() || is_path_escape(&self.entry) {
            return Err(HostError::ManifestInvariant(format!(
                "entry \"{}\" is not a safe relative path",
                self.entry
            )));
        }
        if !self.files.contains_key(&self.entry) {
            return Err(HostError::ManifestInvariant(format!(
                "files does not cover the entry file \"{}\"",
                self.entry
            )));
        }
        for (path, digest) in &self.files {
            if path.is_empty() || is_path_escape(path) {
                return Err(HostError::ManifestInvariant(format!(
                    "file path \"{path}\" is not a safe relative path"
                )));
            }
            if !SHA256_REF.is_match(digest) {
                return Err(HostError::ManifestInvariant(format!(
                    "file \"{path}\" has malformed digest \"{digest}\""
                )));
            }
        }

        // Unknown permission forms reject the whole manifest.
        for perm in &self.permissions {
            permissions::parse_permission(perm)?;
        }

        for method in &self.exposed_methods {
            if method.is_empty() {
                return Err(HostError::ManifestInvariant(
                    "exposedMethods contains an empty name".into(),
                ));
            }
        }

        if let Some(schema) = &self.config_schema {
            validate_schema(schema)?;
        }

        Ok(())
    }

    /// Enforce the api-version window: `[API_MAJOR.0, API_MAJOR.API_MINOR]`.
    fn check_api_version(&self) -> HostResult<()> {
        let supported = format!("{API_MAJOR}.0 through {API_MAJOR}.{API_MINOR}");
        let caps = API_VERSION.captures(&self.api_version).ok_or_else(|| {
            HostError::ManifestInvariant(format!(
                "apiVersion \"{}\" is not \"major.minor\"",
                self.api_version
            ))
        })?;
        let major: u32 = caps[1].parse().unwrap_or(u32::MAX);
        let minor: u32 = caps[2].parse().unwrap_or(u32::MAX);
        if major != API_MAJOR || minor > API_MINOR {
            return Err(HostError::IncompatibleApiVersion {
                declared: self.api_version.clone(),
                supported,
            });
        }
        Ok(())
    }
}

/// Validate a declared config schema itself (not a config value).
fn validate_schema(schema: &ConfigSchema) -> HostResult<()> {
    for (field, spec) in schema {
        if field.is_empty() {
            return Err(HostError::ManifestInvariant(
                "configSchema contains an empty field name".into(),
            ));
        }
        if spec.field_type == ConfigFieldType::Select
            && spec.options.as_ref().is_none_or(|o| o.is_empty())
        {
            return Err(HostError::ManifestInvariant(format!(
                "select field \"{field}\" declares no options"
            )));
        }
        if let (Some(min), Some(max)) = (spec.min, spec.max) {
            if min > max {
                return Err(HostError::ManifestInvariant(format!(
                    "field \"{field}\" has min > max"
                )));
            }
        }
    }
    Ok(())
}

/// Validate a user-supplied config value against a schema. Unknown keys are
/// rejected; missing required fields without defaults are rejected.
pub fn validate_config_value(schema: &ConfigSchema, config: &Value) -> HostResult<()> {
    let map = config
        .as_object()
        .ok_or_else(|| HostError::ConfigInvalid("config must be a JSON object".into()))?;

    for key in map.keys() {
        if !schema.contains_key(key) {
            return Err(HostError::ConfigInvalid(format!("unknown field \"{key}\"")));
        }
    }

    for (field, spec) in schema {
        let value = match map.get(field) {
            Some(v) => v,
            None => {
                if spec.required && spec.default.is_none() {
                    return Err(HostError::ConfigInvalid(format!(
                        "required field \"{field}\" is missing"
                    )));
                }
                continue;
            }
        };
        match spec.field_type {
            ConfigFieldType::String => {
                if !value.is_string() {
                    return Err(HostError::ConfigInvalid(format!(
                        "field \"{field}\" must be a string"
                    )));
                }
            }
            ConfigFieldType::Boolean => {
                if !value.is_boolean() {
                    return Err(HostError::ConfigInvalid(format!(
                        "field \"{field}\" must be a boolean"
                    )));
                }
            }
            ConfigFieldType::Number => {
                let n = value.as_f64().ok_or_else(|| {
                    HostError::ConfigInvalid(format!("field \"{field}\" must be a number"))
                })?;
                if spec.min.is_some_and(|min| n < min) || spec.max.is_some_and(|max| n > max) {
                    return Err(HostError::ConfigInvalid(format!(
                        "field \"{field}\" is out of range"
                    )));
                }
            }
            ConfigFieldType::Select => {
                let s = value.as_str().ok_or_else(|| {
                    HostError::ConfigInvalid(format!("field \"{field}\" must be a string"))
                })?;
                let options = spec.options.as_deref().unwrap_or_default();
                if !options.iter().any(|o| o == s) {
                    return Err(HostError::ConfigInvalid(format!(
                        "field \"{field}\" value \"{s}\" is not one of the declared options"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Merge schema defaults with stored user values into the effective config.
pub fn effective_config(schema: Option<&ConfigSchema>, stored: Option<&Value>) -> Value {
    let mut merged = serde_json::Map::new();
    if let Some(schema) = schema {
        for (field, spec) in schema {
            if let Some(default) = &spec.default {
                merged.insert(field.clone(), default.clone());
            }
        }
    }
    if let Some(Value::Object(user)) = stored {
        for (k, v) in user {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// A minimal valid manifest, shared by tests across the crate.
#[cfg(test)]
pub(crate) fn test_manifest() -> PluginManifest {
    PluginManifest {
        id: "usage-meter".into(),
        name: "Usage Meter".into(),
        version: "1.0.0".into(),
        api_version: "1.0".into(),
        plugin_type: PluginType::Data,
        data_type: Some(DataType::Usage),
        entry: "plugin.js".into(),
        permissions: vec!["network".into(), "timer".into()],
        exposed_methods: vec![],
        config_schema: None,
        subscribed_events: vec![],
        files: BTreeMap::from([(
            "plugin.js".to_string(),
            format!("sha256:{}", "a".repeat(64)),
        )]),
        signature: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_manifest() -> PluginManifest {
        test_manifest()
    }

    #[test]
    fn valid_manifest_passes() {
        assert!(valid_manifest().validate().is_ok());
    }

    #[test]
    fn parses_camel_case_json() {
        let json = json!({
            "id": "usage-meter",
            "name": "Usage Meter",
            "version": "1.0.0",
            "apiVersion": "1.0",
            "pluginType": "data",
            "dataType": "usage",
            "entry": "plugin.js",
            "permissions": ["network"],
            "files": {"plugin.js": format!("sha256:{}", "b".repeat(64))}
        });
        let m = parse_manifest(&json.to_string()).unwrap();
        assert_eq!(m.id, "usage-meter");
        assert_eq!(m.plugin_type, PluginType::Data);
        assert_eq!(m.data_type, Some(DataType::Usage));
    }

    #[test]
    fn rejects_non_kebab_id() {
        for id in ["Spaces Bad", "under_score", "UPPER", "-leading", "trailing-", ""] {
            let mut m = valid_manifest();
            m.id = id.into();
            assert!(m.validate().is_err(), "id {id:?} should be rejected");
        }
    }

    #[test]
    fn rejects_bad_version() {
        let mut m = valid_manifest();
        m.version = "1.0".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn rejects_traversal_in_entry() {
        let mut m = valid_manifest();
        m.entry = "../evil.js".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn rejects_files_not_covering_entry() {
        let mut m = valid_manifest();
        m.files = BTreeMap::from([("other.js".to_string(), format!("sha256:{}", "c".repeat(64)))]);
        assert!(m.validate().is_err());
    }

    #[test]
    fn rejects_traversal_in_files_key() {
        let mut m = valid_manifest();
        m.files.insert(
            "../outside.js".to_string(),
            format!("sha256:{}", "d".repeat(64)),
        );
        assert!(m.validate().is_err());
    }

    #[test]
    fn rejects_malformed_digest() {
        let mut m = valid_manifest();
        m.files
            .insert("extra.json".to_string(), "sha256:nothex".to_string());
        assert!(m.validate().is_err());

        let mut m = valid_manifest();
        m.files
            .insert("extra.json".to_string(), format!("md5:{}", "e".repeat(64)));
        assert!(m.validate().is_err());
    }

    #[test]
    fn digest_hex_case_is_accepted_either_way() {
        let mut m = valid_manifest();
        m.files
            .insert("extra.json".to_string(), format!("sha256:{}", "A".repeat(64)));
        assert!(m.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_permission() {
        let mut m = valid_manifest();
        m.permissions.push("filesystem:everything".into());
        assert!(m.validate().is_err());
    }

    // -- api version window --

    #[test]
    fn accepts_supported_api_versions() {
        for v in ["1.0", "1.1"] {
            let mut m = valid_manifest();
            m.api_version = v.into();
            assert!(m.validate().is_ok(), "apiVersion {v} should be accepted");
        }
    }

    #[test]
    fn rejects_higher_minor() {
        let mut m = valid_manifest();
        m.api_version = "1.2".into();
        let err = m.validate().unwrap_err();
        assert_eq!(err.code(), "IncompatibleApiVersion");
    }

    #[test]
    fn rejects_other_major() {
        for v in ["0.9", "2.0"] {
            let mut m = valid_manifest();
            m.api_version = v.into();
            assert_eq!(m.validate().unwrap_err().code(), "IncompatibleApiVersion");
        }
    }

    #[test]
    fn rejects_malformed_api_version() {
        let mut m = valid_manifest();
        m.api_version = "1".into();
        assert_eq!(m.validate().unwrap_err().code(), "ManifestInvariant");
    }

    // -- path escape --

    #[test]
    fn path_escape_rejects_parent_dir() {
        assert!(is_path_escape("../etc/passwd"));
        assert!(is_path_escape("foo/../bar"));
        assert!(is_path_escape(".."));
    }

    #[test]
    fn path_escape_rejects_absolute() {
        assert!(is_path_escape("/etc/passwd"));
    }

    #[test]
    fn path_escape_allows_normal_relative() {
        assert!(!is_path_escape("plugin.js"));
        assert!(!is_path_escape("assets/icon.png"));
    }

    // -- config schema --

    fn number_schema() -> ConfigSchema {
        BTreeMap::from([(
            "threshold".to_string(),
            ConfigField {
                field_type: ConfigFieldType::Number,
                label: None,
                default: Some(json!(80)),
                required: false,
                options: None,
                min: Some(0.0),
                max: Some(100.0),
            },
        )])
    }

    #[test]
    fn schema_rejects_select_without_options() {
        let schema = BTreeMap::from([(
            "mode".to_string(),
            ConfigField {
                field_type: ConfigFieldType::Select,
                label: None,
                default: None,
                required: false,
                options: None,
                min: None,
                max: None,
            },
        )]);
        assert!(validate_schema(&schema).is_err());
    }

    #[test]
    fn config_value_type_checked() {
        let schema = number_schema();
        assert!(validate_config_value(&schema, &json!({"threshold": 50})).is_ok());
        assert!(validate_config_value(&schema, &json!({"threshold": "high"})).is_err());
        assert!(validate_config_value(&schema, &json!({"threshold": 500})).is_err());
        assert!(validate_config_value(&schema, &json!({"unknown": 1})).is_err());
        assert!(validate_config_value(&schema, &json!([])).is_err());
    }

    #[test]
    fn effective_config_merges_defaults_and_overrides() {
        let schema = number_schema();
        let merged = effective_config(Some(&schema), None);
        assert_eq!(merged["threshold"], json!(80));

        let merged = effective_config(Some(&schema), Some(&json!({"threshold": 95})));
        assert_eq!(merged["threshold"], json!(95));

        let merged = effective_config(None, None);
        assert_eq!(merged, json!({}));
    }
}
