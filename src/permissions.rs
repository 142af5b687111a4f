//! Capability permission grants and the checker consulted on every
//! capability invocation.
//!
//! Permission strings come straight from the manifest:
//! `"call:{target}:{method}"` grants a cross-plugin call; the bare tokens
//! `network`, `timer`, `storage`, `cache` grant the matching capability.
//! Anything else fails to parse and rejects the manifest.

use crate::error::{HostError, HostResult};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::RwLock;

/// How many `try_read` attempts the synchronous check path makes before
/// giving up with `LockContention`.
const READ_ATTEMPTS: usize = 5;

/// A single granted capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PermissionGrant {
    /// May invoke `method` on plugin `target`.
    Call { target: String, method: String },
    Network,
    Timer,
    Storage,
    Cache,
}

impl fmt::Display for PermissionGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionGrant::Call { target, method } => write!(f, "call:{target}:{method}"),
            PermissionGrant::Network => write!(f, "network"),
            PermissionGrant::Timer => write!(f, "timer"),
            PermissionGrant::Storage => write!(f, "storage"),
            PermissionGrant::Cache => write!(f, "cache"),
        }
    }
}

/// Parse one manifest permission string.
pub fn parse_permission(raw: &str) -> HostResult<PermissionGrant> {
    match raw {
        "network" => return Ok(PermissionGrant::Network),
        "timer" => return Ok(PermissionGrant::Timer),
        "storage" => return Ok(PermissionGrant::Storage),
        "cache" => return Ok(PermissionGrant::Cache),
        _ => {}
    }
    if let Some(rest) = raw.strip_prefix("call:") {
        let (target, method) = rest.split_once(':').ok_or_else(|| {
            HostError::ManifestInvariant(format!("malformed call permission \"{raw}\""))
        })?;
        if target.is_empty() || method.is_empty() || method.contains(':') {
            return Err(HostError::ManifestInvariant(format!(
                "malformed call permission \"{raw}\""
            )));
        }
        return Ok(PermissionGrant::Call {
            target: target.to_string(),
            method: method.to_string(),
        });
    }
    Err(HostError::ManifestInvariant(format!(
        "unknown permission \"{raw}\""
    )))
}

/// Parse a full manifest permission list.
pub fn parse_permissions(raw: &[String]) -> HostResult<HashSet<PermissionGrant>> {
    raw.iter().map(|s| parse_permission(s)).collect()
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

/// Holds the granted capability set per plugin. Reads vastly outnumber
/// writes (writes happen only on load/reload/uninstall), hence the
/// reader-writer lock with a non-blocking read path for sync contexts.
#[derive(Default)]
pub struct PermissionChecker {
    grants: RwLock<HashMap<String, HashSet<PermissionGrant>>>,
}

impl PermissionChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the grant set for a plugin.
    pub fn register(&self, plugin_id: &str, grants: HashSet<PermissionGrant>) {
        let mut map = self.grants.write().unwrap_or_else(|e| e.into_inner());
        map.insert(plugin_id.to_string(), grants);
    }

    /// Drop all grants for a plugin.
    pub fn unregister(&self, plugin_id: &str) {
        let mut map = self.grants.write().unwrap_or_else(|e| e.into_inner());
        map.remove(plugin_id);
    }

    /// Blocking check, safe anywhere the caller may wait briefly.
    pub fn check(&self, plugin_id: &str, grant: &PermissionGrant) -> bool {
        let map = self.grants.read().unwrap_or_else(|e| e.into_inner());
        map.get(plugin_id).is_some_and(|set| set.contains(grant))
    }

    /// Non-blocking check used from synchronous dispatch paths. Retries a
    /// bounded number of times with thread yields, then reports
    /// `LockContention` rather than stalling a callback.
    pub fn check_nonblocking(&self, plugin_id: &str, grant: &PermissionGrant) -> HostResult<bool> {
        for attempt in 0..READ_ATTEMPTS {
            match self.grants.try_read() {
                Ok(map) => {
                    return Ok(map.get(plugin_id).is_some_and(|set| set.contains(grant)));
                }
                Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                    // Grant data is plain values; reuse it after a poison.
                    tracing::warn!("permission table lock poisoned; reusing data");
                    let map = poisoned.into_inner();
                    return Ok(map.get(plugin_id).is_some_and(|set| set.contains(grant)));
                }
                Err(std::sync::TryLockError::WouldBlock) => {
                    if attempt + 1 < READ_ATTEMPTS {
                        std::thread::yield_now();
                    }
                }
            }
        }
        Err(HostError::LockContention("permission checker"))
    }

    /// Clone the grant set for a plugin (used when building a sandbox
    /// capability table).
    pub fn grants_of(&self, plugin_id: &str) -> HashSet<PermissionGrant> {
        let map = self.grants.read().unwrap_or_else(|e| e.into_inner());
        map.get(plugin_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_tokens() {
        assert_eq!(parse_permission("network").unwrap(), PermissionGrant::Network);
        assert_eq!(parse_permission("timer").unwrap(), PermissionGrant::Timer);
        assert_eq!(parse_permission("storage").unwrap(), PermissionGrant::Storage);
        assert_eq!(parse_permission("cache").unwrap(), PermissionGrant::Cache);
    }

    #[test]
    fn parses_call_form() {
        let g = parse_permission("call:other-plugin:getBalance").unwrap();
        assert_eq!(
            g,
            PermissionGrant::Call {
                target: "other-plugin".into(),
                method: "getBalance".into()
            }
        );
        assert_eq!(g.to_string(), "call:other-plugin:getBalance");
    }

    #[test]
    fn rejects_unknown_forms() {
        for raw in ["net", "call:", "call:only-target", "call::m", "call:t:", "", "NETWORK"] {
            assert!(parse_permission(raw).is_err(), "{raw:?} should fail");
        }
    }

    #[test]
    fn rejects_extra_colons_in_method() {
        assert!(parse_permission("call:t:m:extra").is_err());
    }

    #[test]
    fn checker_grants_and_revokes() {
        let checker = PermissionChecker::new();
        let grants = parse_permissions(&["network".into(), "timer".into()]).unwrap();
        checker.register("p1", grants);

        assert!(checker.check("p1", &PermissionGrant::Network));
        assert!(!checker.check("p1", &PermissionGrant::Storage));
        assert!(!checker.check("p2", &PermissionGrant::Network));

        checker.unregister("p1");
        assert!(!checker.check("p1", &PermissionGrant::Network));
    }

    #[test]
    fn nonblocking_check_succeeds_without_contention() {
        let checker = PermissionChecker::new();
        checker.register(
            "p1",
            HashSet::from([PermissionGrant::Cache]),
        );
        assert!(checker.check_nonblocking("p1", &PermissionGrant::Cache).unwrap());
        assert!(!checker.check_nonblocking("p1", &PermissionGrant::Network).unwrap());
    }

    #[test]
    fn nonblocking_check_reports_contention_under_writer() {
        use std::sync::Arc;
        let checker = Arc::new(PermissionChecker::new());
        // Hold the write lock on another thread while checking.
        let guard = checker.grants.write().unwrap();
        let c2 = Arc::clone(&checker);
        let handle = std::thread::spawn(move || {
            c2.check_nonblocking("p", &PermissionGrant::Network)
        });
        let result = handle.join().unwrap();
        drop(guard);
        assert!(matches!(result, Err(HostError::LockContention(_))));
    }

    #[test]
    fn grants_of_clones_set() {
        let checker = PermissionChecker::new();
        let grants = parse_permissions(&["cache".into(), "call:t:m".into()]).unwrap();
        checker.register("p1", grants.clone());
        assert_eq!(checker.grants_of("p1"), grants);
        assert!(checker.grants_of("absent").is_empty());
    }
}
