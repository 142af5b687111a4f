//! Ed25519 manifest signatures and the trust store.
//!
//! A signed manifest carries `"signature": "ed25519:{keyId}:{base64}"` where
//! the signed message is the RFC 8785 canonical form of the manifest with
//! the `signature` member removed. Keys come from two places: the trust
//! root embedded in the binary, and keys the user has explicitly imported
//! into `{config_dir}/trusted_keys.json`. Test keys exist only in test
//! builds.

use crate::canonical_json;
use crate::config;
use crate::error::{HostError, HostResult};
use crate::manifest::PluginManifest;
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Key id of the QuotaBar release-signing root.
pub const OFFICIAL_KEY_ID: &str = "cuk-official-2025";

/// Base64 form of the embedded release-signing public key.
const OFFICIAL_KEY_B64: &str = "/FHNjmIYoaONpH7QAjDwWAgW7RO6MwOsXeuRFUiQgCU=";

/// Seed for the key test builds sign with. Test builds only.
#[cfg(test)]
pub(crate) const TEST_KEY_SEED: [u8; 32] = [7u8; 32];
#[cfg(test)]
pub(crate) const TEST_KEY_ID: &str = "qa-test-key";

// ---------------------------------------------------------------------------
// Trust store
// ---------------------------------------------------------------------------

/// Where a trusted key came from. Embedded keys outrank user imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeySource {
    Embedded,
    UserImported,
}

/// One verification key the host will accept signatures from.
#[derive(Debug, Clone)]
pub struct TrustedKey {
    pub key_id: String,
    pub public_key: VerifyingKey,
    pub source: KeySource,
}

/// On-disk form of a user-imported key.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKey {
    key_id: String,
    public_key: String,
}

/// Trust policy applied when looking up a signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Any key in the store is acceptable.
    AnyTrusted,
    /// Only the embedded root is acceptable (marketplace updates).
    EmbeddedOnly,
}

/// The set of keys signature verification consults.
pub struct TrustStore {
    keys: Vec<TrustedKey>,
}

impl TrustStore {
    /// Embedded keys plus whatever the user has imported on disk.
    pub fn load() -> Self {
        let mut keys = embedded_keys();
        keys.extend(load_user_keys(&config::trusted_keys_path()));
        Self { keys }
    }

    /// Embedded keys only; no filesystem access.
    pub fn embedded_only() -> Self {
        Self {
            keys: embedded_keys(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_keys(keys: Vec<TrustedKey>) -> Self {
        Self { keys }
    }

    fn find(&self, key_id: &str) -> Option<&TrustedKey> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }
}

fn embedded_keys() -> Vec<TrustedKey> {
    let mut keys = Vec::with_capacity(2);
    // The embedded constant is fixed at build time; decoding cannot fail.
    if let Ok(bytes) = Base64.decode(OFFICIAL_KEY_B64) {
        if let Ok(arr) = <[u8; 32]>::try_from(bytes.as_slice()) {
            if let Ok(public_key) = VerifyingKey::from_bytes(&arr) {
                keys.push(TrustedKey {
                    key_id: OFFICIAL_KEY_ID.to_string(),
                    public_key,
                    source: KeySource::Embedded,
                });
            }
        }
    }

    #[cfg(test)]
    {
        let signing = ed25519_dalek::SigningKey::from_bytes(&TEST_KEY_SEED);
        keys.push(TrustedKey {
            key_id: TEST_KEY_ID.to_string(),
            public_key: signing.verifying_key(),
            source: KeySource::Embedded,
        });
    }

    keys
}

/// Parse the user trusted-keys file. Malformed entries are skipped with a
/// warning; a missing file is simply an empty list.
fn load_user_keys(path: &std::path::Path) -> Vec<TrustedKey> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return Vec::new(),
    };
    let stored: Vec<StoredKey> = match serde_json::from_str(&text) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("ignoring unparseable trusted-keys file: {e}");
            return Vec::new();
        }
    };

    let mut keys = Vec::new();
    for entry in stored {
        let Ok(bytes) = Base64.decode(&entry.public_key) else {
            tracing::warn!(key_id = %entry.key_id, "skipping key with invalid base64");
            continue;
        };
        let Ok(arr) = <[u8; 32]>::try_from(bytes.as_slice()) else {
            tracing::warn!(key_id = %entry.key_id, "skipping key with wrong length");
            continue;
        };
        let Ok(public_key) = VerifyingKey::from_bytes(&arr) else {
            tracing::warn!(key_id = %entry.key_id, "skipping key that is not a valid point");
            continue;
        };
        keys.push(TrustedKey {
            key_id: entry.key_id,
            public_key,
            source: KeySource::UserImported,
        });
    }
    keys
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Verify a manifest's signature against the trust store.
pub fn verify(manifest: &PluginManifest, store: &TrustStore, policy: TrustPolicy) -> HostResult<()> {
    let raw = manifest
        .signature
        .as_deref()
        .ok_or(HostError::MissingSignature)?;

    let (key_id, sig_b64) = parse_signature_ref(raw)?;

    let key = store
        .find(key_id)
        .ok_or_else(|| HostError::UnknownKeyId(key_id.to_string()))?;
    if policy == TrustPolicy::EmbeddedOnly && key.source != KeySource::Embedded {
        return Err(HostError::SignatureUntrusted(key_id.to_string()));
    }

    let sig_bytes = Base64
        .decode(sig_b64)
        .map_err(|e| HostError::MalformedSignature(format!("invalid base64: {e}")))?;
    let sig_arr: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| {
        HostError::MalformedSignature(format!("expected 64 bytes, got {}", sig_bytes.len()))
    })?;
    let signature = Signature::from_bytes(&sig_arr);

    let value = serde_json::to_value(manifest)
        .map_err(|e| HostError::ManifestInvariant(e.to_string()))?;
    let message = canonical_json::canonicalize_for_signing(&value);

    key.public_key
        .verify(&message, &signature)
        .map_err(|_| HostError::BadSignature)
}

/// Split `"ed25519:{keyId}:{base64}"` into its parts.
fn parse_signature_ref(raw: &str) -> HostResult<(&str, &str)> {
    let rest = raw
        .strip_prefix("ed25519:")
        .ok_or_else(|| HostError::MalformedSignature("unsupported algorithm".into()))?;
    let (key_id, sig) = rest
        .split_once(':')
        .ok_or_else(|| HostError::MalformedSignature("missing key id separator".into()))?;
    if key_id.is_empty() || sig.is_empty() {
        return Err(HostError::MalformedSignature("empty key id or payload".into()));
    }
    Ok((key_id, sig))
}

// ---------------------------------------------------------------------------
// Test-build signing helper
// ---------------------------------------------------------------------------

/// Sign a manifest with the test key and return it with `signature` set.
#[cfg(test)]
pub(crate) fn sign_with_test_key(mut manifest: PluginManifest) -> PluginManifest {
    use ed25519_dalek::Signer;

    manifest.signature = None;
    let value = serde_json::to_value(&manifest).unwrap();
    let message = canonical_json::canonicalize_for_signing(&value);
    let signing = ed25519_dalek::SigningKey::from_bytes(&TEST_KEY_SEED);
    let sig = signing.sign(&message);
    manifest.signature = Some(format!(
        "ed25519:{TEST_KEY_ID}:{}",
        Base64.encode(sig.to_bytes())
    ));
    manifest
}
