//! SHA-256 verification of installed plugin files against the manifest.
//!
//! Every file the manifest lists is read through the descriptor-chain
//! reader, hashed, and compared against its declared `"sha256:<hex>"`
//! digest. Any missing file, unsafe path, or digest mismatch fails the
//! whole plugin.

use crate::entry_reader;
use crate::error::{HostError, HostResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Compute the lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Verify every entry of a manifest `files` map against the plugin root.
pub fn verify_files(plugin_root: &Path, files: &BTreeMap<String, String>) -> HostResult<()> {
    for (relative, declared) in files {
        let expected = declared
            .strip_prefix("sha256:")
            .ok_or_else(|| HostError::IntegrityMismatch {
                path: relative.clone(),
            })?;

        let content = entry_reader::read_file_at(plugin_root, relative).map_err(|e| match e {
            // A file that cannot be resolved safely is an integrity failure
            // of the install, not a transient i/o condition.
            HostError::PathTraversal(_) | HostError::SymlinkRejected(_) | HostError::Io(_) => {
                HostError::IntegrityMismatch {
                    path: relative.clone(),
                }
            }
            other => other,
        })?;

        let actual = sha256_hex(&content);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(HostError::IntegrityMismatch {
                path: relative.clone(),
            });
        }
    }
    Ok(())
}
