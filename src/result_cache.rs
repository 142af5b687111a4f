//! Fingerprint-keyed result cache with per-plugin invalidation.
//!
//! A TTL'd LRU maps request fingerprints to produced artefacts. A separate
//! inverse index maps plugin id → owned keys so `invalidate_plugin` can
//! drop everything a plugin produced in one atomic sweep; both structures
//! live under one lock. Eviction (LRU displacement and TTL expiry) informs
//! the inverse index, so the index never accumulates keys that can only
//! miss.

use crate::canonical_json;
use crate::instance::Artefact;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Stable cache key for a refresh request: the plugin id plus the
/// canonical form of the request descriptor, hashed.
pub fn fingerprint(plugin_id: &str, descriptor: &serde_json::Value) -> String {
    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(plugin_id.as_bytes());
    message.push(0);
    message.extend_from_slice(&canonical_json::canonicalize(descriptor));
    crate::integrity::sha256_hex(&message)
}

struct CacheEntry {
    artefact: Artefact,
    inserted_at: Instant,
    ttl: Duration,
    owners: HashSet<String>,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

struct CacheState {
    store: lru::LruCache<String, CacheEntry>,
    /// plugin id → keys it owns.
    owners_index: HashMap<String, HashSet<String>>,
}

impl CacheState {
    fn unindex(&mut self, key: &str, owners: &HashSet<String>) {
        for owner in owners {
            if let Some(keys) = self.owners_index.get_mut(owner) {
                keys.remove(key);
                if keys.is_empty() {
                    self.owners_index.remove(owner);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

pub struct ResultCache {
    state: Mutex<CacheState>,
    default_ttl: Duration,
    pub stats: CacheStats,
}

impl ResultCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                store: lru::LruCache::new(capacity),
                owners_index: HashMap::new(),
            }),
            default_ttl,
            stats: CacheStats::default(),
        }
    }

    pub fn from_config(config: &crate::config::HostConfig) -> Self {
        Self::new(
            config.cache_capacity,
            Duration::from_secs(config.cache_ttl_secs),
        )
    }

    /// Look up a fresh entry. Expired entries are removed (and unindexed)
    /// on the way out.
    pub fn get(&self, key: &str) -> Option<Artefact> {
        let mut state = self.state.lock();
        let expired = state.store.peek(key).is_some_and(CacheEntry::expired);
        if expired {
            if let Some(entry) = state.store.pop(key) {
                let owners = entry.owners;
                state.unindex(key, &owners);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match state.store.get(key) {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.artefact.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert an artefact and update the inverse index, including for any
    /// entry the LRU displaces to make room.
    pub fn set(&self, key: &str, artefact: Artefact, ttl: Option<Duration>, owners: &[String]) {
        let owner_set: HashSet<String> = owners.iter().cloned().collect();
        let mut state = self.state.lock();

        // Replacing an existing entry may change its owner set.
        if let Some(previous) = state.store.pop(key) {
            let old_owners = previous.owners;
            state.unindex(key, &old_owners);
        }

        let displaced = state.store.push(
            key.to_string(),
            CacheEntry {
                artefact,
                inserted_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                owners: owner_set.clone(),
            },
        );
        if let Some((evicted_key, evicted_entry)) = displaced {
            if evicted_key != key {
                let owners = evicted_entry.owners;
                state.unindex(&evicted_key, &owners);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        for owner in owner_set {
            state
                .owners_index
                .entry(owner)
                .or_default()
                .insert(key.to_string());
        }
    }

    /// Cached artefact for `key`, or compute, cache, and return it. The
    /// lock is never held across the compute await; two racing computes
    /// both run and the later write wins, which is sound for idempotent
    /// refreshes.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        owners: &[String],
        ttl: Option<Duration>,
        compute: F,
    ) -> crate::error::HostResult<Artefact>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::error::HostResult<Artefact>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let artefact = compute().await?;
        self.set(key, artefact.clone(), ttl, owners);
        Ok(artefact)
    }

    /// Drop every entry owned by a plugin. Entries co-owned with other
    /// plugins are removed as well: ownership means "must not survive
    /// this plugin's invalidation".
    pub fn invalidate_plugin(&self, plugin_id: &str) {
        let mut state = self.state.lock();
        let Some(keys) = state.owners_index.remove(plugin_id) else {
            return;
        };
        for key in keys {
            if let Some(entry) = state.store.pop(&key) {
                let mut owners = entry.owners;
                owners.remove(plugin_id);
                state.unindex(&key, &owners);
            }
        }
    }

    /// Number of live entries (expired ones may still be counted until
    /// touched).
    pub fn len(&self) -> usize {
        self.state.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
