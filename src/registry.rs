//! Marketplace registry client: fetch the remote plugin index, compare
//! installed versions, and download update archives.
//!
//! The registry itself is an external collaborator; this module only
//! speaks its JSON index format and hands archives to the installer.
//! Downloads are streamed against a hard size cap, matching the archive
//! extractor's total budget.

use crate::error::{HostError, HostResult};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Default registry URL: the raw `registry.json` in the public repo.
const DEFAULT_REGISTRY_URL: &str =
    "https://raw.githubusercontent.com/quotabar/plugin-registry/main/registry.json";

/// Largest update archive the client will download (matches the
/// extractor's total budget).
const MAX_ARCHIVE_BYTES: u64 = 50 * 1024 * 1024;

/// A single entry in the remote plugin registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    pub latest_version: String,
    /// Lowest host api version the plugin requires.
    #[serde(default)]
    pub min_api_version: String,
    /// Direct HTTPS download URL for the `.zip` archive.
    pub download_url: String,
}

/// An available update for an installed plugin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub id: String,
    pub installed_version: String,
    pub latest_version: String,
    pub download_url: String,
}

/// Fetch the default remote plugin registry.
pub async fn fetch_registry() -> HostResult<Vec<RegistryEntry>> {
    fetch_registry_from(DEFAULT_REGISTRY_URL).await
}

/// Inner fetch logic (testable, accepts arbitrary URL).
pub(crate) async fn fetch_registry_from(url: &str) -> HostResult<Vec<RegistryEntry>> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| HostError::NetworkError(format!("registry fetch: {e}")))?;

    if !response.status().is_success() {
        return Err(HostError::NetworkError(format!(
            "registry returned HTTP {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| HostError::NetworkError(format!("registry parse: {e}")))
}

/// Compare two dotted numeric versions segment by segment. Non-numeric
/// segments compare as zero, so a malformed remote version can never look
/// newer than a real one.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|s| s.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (
            a.get(i).copied().unwrap_or(0),
            b.get(i).copied().unwrap_or(0),
        );
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Cross installed versions against the registry index.
pub fn available_updates(
    entries: &[RegistryEntry],
    installed: &[(String, String)],
) -> Vec<UpdateInfo> {
    let mut updates = Vec::new();
    for (id, installed_version) in installed {
        let Some(entry) = entries.iter().find(|e| &e.id == id) else {
            continue;
        };
        if compare_versions(&entry.latest_version, installed_version) == Ordering::Greater {
            updates.push(UpdateInfo {
                id: id.clone(),
                installed_version: installed_version.clone(),
                latest_version: entry.latest_version.clone(),
                download_url: entry.download_url.clone(),
            });
        }
    }
    updates
}

/// Download an update archive into `dest_dir`, streaming against the size
/// cap. Returns the path of the written `.zip`.
pub async fn download_archive(url: &str, dest_dir: &Path) -> HostResult<PathBuf> {
    let parsed = url::Url::parse(url).map_err(|e| HostError::InvalidUrl(e.to_string()))?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Err(HostError::InvalidUrl(format!(
            "archive url scheme \"{}\" not allowed",
            parsed.scheme()
        )));
    }

    let response = reqwest::get(url)
        .await
        .map_err(|e| HostError::NetworkError(format!("archive download: {e}")))?;
    if !response.status().is_success() {
        return Err(HostError::NetworkError(format!(
            "archive download returned HTTP {}",
            response.status()
        )));
    }

    std::fs::create_dir_all(dest_dir)?;
    let path = dest_dir.join(format!("update-{}.zip", uuid::Uuid::new_v4().simple()));

    let mut written: u64 = 0;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| HostError::ReadError(e.to_string()))?;
        written += chunk.len() as u64;
        if written > MAX_ARCHIVE_BYTES {
            return Err(HostError::ArchiveTooLarge {
                written,
                max: MAX_ARCHIVE_BYTES,
            });
        }
        body.extend_from_slice(&chunk);
    }
    std::fs::write(&path, &body)?;
    Ok(path)
}
