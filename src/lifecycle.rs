//! The plugin host: sole owner of plugin instances and every state
//! transition.
//!
//! All other components expose narrow operations (`cancel_all_for`,
//! `unsubscribe_only`, `invalidate_plugin`, `unregister`) that the host
//! invokes during transitions; none of them owns plugin state and none
//! owns another component. The event bus stores only plugin ids and calls
//! back into the host at dispatch time, which keeps the object graph
//! acyclic (handlers hold a `Weak` host reference).
//!
//! Refreshes run through the reliability pipeline: rate limiter →
//! result cache → scheduler → retry → sandbox.

use crate::calls::CallRouter;
use crate::config::HostConfig;
use crate::entry_reader;
use crate::error::{HostError, HostResult};
use crate::event_bus::{EventBus, EventHandler};
use crate::extract;
use crate::host_log::PluginLog;
use crate::instance::{Artefact, HealthStatus, PluginInstance, PluginState};
use crate::integrity;
use crate::manifest::{self, ConfigSchema, PluginManifest};
use crate::permissions::{parse_permissions, PermissionChecker};
use crate::rate_limit::RateLimiter;
use crate::result_cache::{fingerprint, ResultCache};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::sandbox::{ExecutionOutput, Invocation, SandboxRuntime};
use crate::scheduler::Scheduler;
use crate::secure_fetch::SecureFetch;
use crate::signature::{self, TrustPolicy, TrustStore};
use crate::storage::PluginStorage;
use crate::timers::{TimerCallback, TimerKind, TimerRegistry};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

pub struct PluginHost {
    config: HostConfig,
    plugins_root: PathBuf,
    plugins: DashMap<String, PluginInstance>,
    /// Registered config schemas, kept even while a plugin is disabled so
    /// its stored config stays readable.
    schemas: DashMap<String, ConfigSchema>,
    bus: Arc<EventBus>,
    timers: Arc<TimerRegistry>,
    checker: Arc<PermissionChecker>,
    router: Arc<CallRouter>,
    cache: Arc<ResultCache>,
    scheduler: Arc<Scheduler<Artefact>>,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    pub(crate) fetch: Arc<SecureFetch>,
    sandbox: Arc<SandboxRuntime>,
    storage: PluginStorage,
    log: PluginLog,
    trust: TrustStore,
    started: AtomicBool,
}

impl PluginHost {
    /// Wire up the full component graph. Must run inside a tokio runtime
    /// (the scheduler spawns its worker immediately).
    pub fn new(config: HostConfig, plugins_root: PathBuf, trust: TrustStore) -> Arc<Self> {
        let fetch = Arc::new(SecureFetch::from_config(&config));
        let timers = Arc::new(TimerRegistry::new());
        let bus = Arc::new(EventBus::from_config(&config));
        let checker = Arc::new(PermissionChecker::new());
        let router = Arc::new(CallRouter::new(Arc::clone(&checker)));
        let cache = Arc::new(ResultCache::from_config(&config));
        let scheduler = Scheduler::from_config(&config);
        let rate_limiter = Arc::new(RateLimiter::from_config(&config));
        let retry = RetryExecutor::new(RetryConfig::default())
            .expect("default retry config is valid");
        let storage = PluginStorage::new(plugins_root.clone());
        let log = PluginLog::new();
        let sandbox = Arc::new(SandboxRuntime::new(
            Arc::clone(&fetch),
            Arc::clone(&timers),
            Arc::clone(&bus),
            Arc::clone(&router),
            storage.clone(),
            log.clone(),
            &config,
        ));

        Arc::new(Self {
            config,
            plugins_root,
            plugins: DashMap::new(),
            schemas: DashMap::new(),
            bus,
            timers,
            checker,
            router,
            cache,
            scheduler,
            rate_limiter,
            retry,
            fetch,
            sandbox,
            storage,
            log,
            trust,
            started: AtomicBool::new(false),
        })
    }

    /// Host rooted at the production plugins directory with the full
    /// trust store.
    pub fn with_defaults(config: HostConfig) -> Arc<Self> {
        Self::new(config, crate::config::plugins_dir(), TrustStore::load())
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn plugin_log(&self) -> &PluginLog {
        &self.log
    }

    // -- init / shutdown ----------------------------------------------------

    /// Discover installed plugins and start the dispatchers. Idempotent:
    /// only the first call does anything.
    pub async fn init(self: &Arc<Self>) -> HostResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("host already initialised; ignoring");
            return Ok(());
        }
        std::fs::create_dir_all(&self.plugins_root)?;
        self.discover_and_load().await;
        self.bus.start_dispatcher();
        self.router.start_dispatcher();
        self.bus
            .emit_ipc("plugins_ready", json!({"count": self.plugins.len()}))
            .await?;
        Ok(())
    }

    /// Stop dispatchers and drain state. Terminal.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.plugins.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.timers.cancel_all_for(&id).await;
        }
        self.scheduler.shutdown().await;
        self.bus.stop_dispatcher();
        self.router.stop_dispatcher();
    }

    // -- discovery ----------------------------------------------------------

    async fn discover_and_load(self: &Arc<Self>) {
        let entries = match std::fs::read_dir(&self.plugins_root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!("failed to read plugins dir: {e}");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if dir_name.starts_with('.') {
                continue;
            }
            if let Err(e) = self.load_plugin(&path, dir_name).await {
                tracing::warn!(plugin = dir_name, "failed to load: {e}");
            }
        }
    }

    /// Parse, verify, and register one plugin directory. On verification
    /// failure the plugin is recorded as Disabled with the error message
    /// persisted, so the shell can show it; the host never goes down over
    /// one bad plugin.
    async fn load_plugin(self: &Arc<Self>, root: &Path, dir_name: &str) -> HostResult<()> {
        let manifest_text = std::fs::read_to_string(root.join("manifest.json"))
            .map_err(|e| HostError::ManifestParse(format!("{dir_name}: {e}")))?;
        let manifest = manifest::parse_manifest(&manifest_text)?;
        if manifest.id != dir_name {
            return Err(HostError::ManifestInvariant(format!(
                "id \"{}\" does not match directory name \"{dir_name}\"",
                manifest.id
            )));
        }

        let verification = signature::verify(&manifest, &self.trust, TrustPolicy::AnyTrusted)
            .and_then(|()| integrity::verify_files(root, &manifest.files));

        let mut instance = PluginInstance::new(manifest.clone(), root.to_path_buf());
        match verification {
            Ok(()) => {
                instance.state = PluginState::Validated;
                instance.effective_config = self.effective_config_for(&manifest);
                self.register_plugin(&instance).await?;
            }
            Err(e) => {
                tracing::warn!(plugin = %manifest.id, "verification failed: {e}");
                instance.state = PluginState::Disabled;
                instance.load_error = Some(format!("{}: {e}", e.code()));
            }
        }
        self.plugins.insert(manifest.id.clone(), instance);
        Ok(())
    }

    /// Register a validated plugin's schema, grants, methods,
    /// subscriptions, and event handler.
    async fn register_plugin(self: &Arc<Self>, instance: &PluginInstance) -> HostResult<()> {
        let id = &instance.manifest.id;
        if let Some(schema) = &instance.manifest.config_schema {
            self.schemas.insert(id.clone(), schema.clone());
        }
        self.checker
            .register(id, parse_permissions(&instance.manifest.permissions)?);
        self.router
            .register_methods(id, instance.exposed_methods.clone());
        let topics: Vec<String> = instance.subscriptions.iter().cloned().collect();
        self.bus.subscribe(id, &topics).await;
        self.bus.register_handler(id, self.event_handler(id)).await;
        Ok(())
    }

    /// Handler stored in the bus under this plugin's id. Holds only a weak
    /// host reference; dispatch looks the live instance up at event time.
    fn event_handler(self: &Arc<Self>, plugin_id: &str) -> EventHandler {
        let host: Weak<PluginHost> = Arc::downgrade(self);
        let plugin_id = plugin_id.to_string();
        Arc::new(move |topic, payload| {
            let host = host.clone();
            let plugin_id = plugin_id.clone();
            async move {
                if let Some(host) = host.upgrade() {
                    host.deliver_event(&plugin_id, topic, payload).await;
                }
            }
            .boxed()
        })
    }

    async fn deliver_event(self: &Arc<Self>, plugin_id: &str, topic: String, payload: Value) {
        let Some((source, permissions, config)) = self.execution_inputs(plugin_id) else {
            return;
        };
        let result = self
            .sandbox
            .execute(
                plugin_id,
                &source,
                permissions,
                config,
                Invocation::Event {
                    topic: topic.clone(),
                    data: payload,
                },
                Some(Duration::from_millis(self.config.sandbox_timeout_ms)),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(plugin = plugin_id, %topic, "event handler failed: {e}");
            self.report_plugin_error(plugin_id, &e).await;
        }
    }

    /// Entry source + grants + config for an enabled plugin, cloned out so
    /// no map reference is held across an await.
    fn execution_inputs(
        &self,
        plugin_id: &str,
    ) -> Option<(String, HashSet<crate::permissions::PermissionGrant>, Value)> {
        let instance = self.plugins.get(plugin_id)?;
        if !instance.is_enabled() {
            return None;
        }
        let source = entry_reader::read_entry(&instance.root, &instance.manifest).ok()?;
        Some((
            source.content,
            source.permissions,
            instance.effective_config.clone(),
        ))
    }

    // -- enable / disable ---------------------------------------------------

    pub async fn enable(self: &Arc<Self>, plugin_id: &str) -> HostResult<()> {
        let manifest = {
            let mut instance = self
                .plugins
                .get_mut(plugin_id)
                .ok_or_else(|| HostError::UnknownPlugin(plugin_id.to_string()))?;
            if let Some(error) = &instance.load_error {
                return Err(HostError::ManifestInvariant(format!(
                    "plugin failed verification: {error}"
                )));
            }
            if instance.is_enabled() {
                return Ok(());
            }
            instance.state = PluginState::Enabled;
            instance.effective_config = self.effective_config_for(&instance.manifest);
            instance.manifest.clone()
        };

        // Re-register everything disable revoked, so disable→enable
        // converges to the same steady state as a fresh load.
        self.checker
            .register(plugin_id, parse_permissions(&manifest.permissions)?);
        let (methods, topics) = {
            let instance = self.plugins.get(plugin_id).expect("inserted above");
            (
                instance.exposed_methods.clone(),
                instance.subscriptions.iter().cloned().collect::<Vec<_>>(),
            )
        };
        self.router.register_methods(plugin_id, methods);
        self.bus.subscribe(plugin_id, &topics).await;

        // Periodic refresh for data plugins, plus an immediate one.
        if manifest.plugin_type == crate::manifest::PluginType::Data {
            let timer_id = self
                .timers
                .schedule(
                    plugin_id,
                    TimerKind::Interval,
                    Duration::from_secs(self.config.refresh_interval_secs),
                    self.refresh_callback(plugin_id),
                )
                .await;
            if let Some(mut instance) = self.plugins.get_mut(plugin_id) {
                instance.refresh_timer = Some(timer_id);
            }

            let host = Arc::clone(self);
            let id = plugin_id.to_string();
            tokio::spawn(async move {
                let _ = host.refresh_plugin(&id).await;
            });
        }
        Ok(())
    }

    /// Timer callback that re-enters the refresh pipeline. Weak reference:
    /// a timer must never keep the host alive.
    fn refresh_callback(self: &Arc<Self>, plugin_id: &str) -> TimerCallback {
        let host: Weak<PluginHost> = Arc::downgrade(self);
        let plugin_id = plugin_id.to_string();
        Arc::new(move || {
            if let Some(host) = host.upgrade() {
                let id = plugin_id.clone();
                tokio::spawn(async move {
                    let _ = host.refresh_plugin(&id).await;
                });
            }
        })
    }

    pub async fn disable(&self, plugin_id: &str) -> HostResult<()> {
        {
            let mut instance = self
                .plugins
                .get_mut(plugin_id)
                .ok_or_else(|| HostError::UnknownPlugin(plugin_id.to_string()))?;
            instance.state = PluginState::Disabled;
            instance.refresh_timer = None;
        }
        self.timers.cancel_all_for(plugin_id).await;
        // Subscriptions go, the handler slot stays (reload relies on it).
        self.bus.unsubscribe_only(plugin_id).await;
        self.checker.unregister(plugin_id);
        self.router.unregister_methods(plugin_id);
        self.cache.invalidate_plugin(plugin_id);
        if let Some(mut instance) = self.plugins.get_mut(plugin_id) {
            instance.cache_keys.clear();
        }
        Ok(())
    }

    // -- reload -------------------------------------------------------------

    /// Two-phase reload: validate the new manifest without touching any
    /// registration, then swap atomically. A validation failure leaves
    /// every registration byte-identical to its pre-reload value.
    pub async fn reload(self: &Arc<Self>, plugin_id: &str) -> HostResult<()> {
        let root = {
            let instance = self
                .plugins
                .get(plugin_id)
                .ok_or_else(|| HostError::UnknownPlugin(plugin_id.to_string()))?;
            instance.root.clone()
        };

        // Phase 1: validate, no mutation.
        let manifest_path = root.join("manifest.json");
        let manifest_text = match std::fs::read_to_string(&manifest_path) {
            Ok(text) => text,
            Err(e) => {
                // The plugin vanished underneath us: tear down what it had
                // registered and report.
                tracing::warn!(plugin = plugin_id, "manifest gone during reload: {e}");
                self.disable(plugin_id).await?;
                return Err(HostError::ManifestParse(format!(
                    "manifest unreadable during reload: {e}"
                )));
            }
        };
        let new_manifest = manifest::parse_manifest(&manifest_text)?;
        if new_manifest.id != plugin_id {
            return Err(HostError::ManifestInvariant(format!(
                "reload changed id to \"{}\"",
                new_manifest.id
            )));
        }
        signature::verify(&new_manifest, &self.trust, TrustPolicy::AnyTrusted)?;
        integrity::verify_files(&root, &new_manifest.files)?;
        let new_grants = parse_permissions(&new_manifest.permissions)?;

        // Phase 2: swap. Validation cannot fail past this point.
        self.bus.unsubscribe_only(plugin_id).await;
        self.checker.unregister(plugin_id);
        self.router.unregister_methods(plugin_id);
        self.schemas.remove(plugin_id);

        if let Some(schema) = &new_manifest.config_schema {
            self.schemas.insert(plugin_id.to_string(), schema.clone());
        }
        // Validated and Enabled plugins carry live registrations; a
        // Disabled plugin stays unregistered until its next enable.
        let keep_registered = {
            let instance = self.plugins.get(plugin_id).expect("checked above");
            instance.state != PluginState::Disabled
        };
        let new_subscriptions: HashSet<String> =
            new_manifest.subscribed_events.iter().cloned().collect();
        let new_methods: HashSet<String> =
            new_manifest.exposed_methods.iter().cloned().collect();
        if keep_registered {
            self.checker.register(plugin_id, new_grants);
            self.router
                .register_methods(plugin_id, new_methods.clone());
            let topics: Vec<String> = new_subscriptions.iter().cloned().collect();
            self.bus.subscribe(plugin_id, &topics).await;
        }

        let effective = self.effective_config_for(&new_manifest);
        if let Some(mut instance) = self.plugins.get_mut(plugin_id) {
            instance.manifest = new_manifest;
            instance.subscriptions = new_subscriptions;
            instance.exposed_methods = new_methods;
            instance.effective_config = effective;
            instance.load_error = None;
        }
        self.cache.invalidate_plugin(plugin_id);
        Ok(())
    }

    // -- install / uninstall / update ----------------------------------------

    /// Install a plugin archive: extract to a hidden staging directory,
    /// verify everything there, then promote atomically.
    pub async fn install(self: &Arc<Self>, archive: &Path) -> HostResult<String> {
        std::fs::create_dir_all(&self.plugins_root)?;
        let staging = self
            .plugins_root
            .join(format!(".install-{}", uuid::Uuid::new_v4().simple()));

        let result = self.install_staged(archive, &staging).await;
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&staging);
        }
        result
    }

    async fn install_staged(self: &Arc<Self>, archive: &Path, staging: &Path) -> HostResult<String> {
        extract::extract_archive(archive, staging)?;

        let manifest_text = std::fs::read_to_string(staging.join("manifest.json"))
            .map_err(|e| HostError::ManifestParse(format!("archive has no manifest: {e}")))?;
        let manifest = manifest::parse_manifest(&manifest_text)?;
        signature::verify(&manifest, &self.trust, TrustPolicy::AnyTrusted)?;
        integrity::verify_files(staging, &manifest.files)?;

        let target = self.plugins_root.join(&manifest.id);
        let replacing = self.plugins.contains_key(&manifest.id);
        if replacing {
            self.disable(&manifest.id).await.ok();
        }
        extract::promote(staging, &target)?;

        let mut instance = PluginInstance::new(manifest.clone(), target);
        instance.state = PluginState::Validated;
        instance.effective_config = self.effective_config_for(&manifest);
        self.register_plugin(&instance).await?;
        self.plugins.insert(manifest.id.clone(), instance);

        let action = if replacing {
            "plugin_updated"
        } else {
            "plugin_installed"
        };
        self.bus.emit_ipc(action, json!({"id": manifest.id})).await?;
        Ok(manifest.id)
    }

    pub async fn uninstall(self: &Arc<Self>, plugin_id: &str) -> HostResult<()> {
        self.disable(plugin_id).await?;
        self.bus.remove_plugin(plugin_id).await;
        self.schemas.remove(plugin_id);
        self.rate_limiter.remove_plugin(plugin_id);

        let root = self
            .plugins
            .remove(plugin_id)
            .map(|(_, instance)| instance.root)
            .ok_or_else(|| HostError::UnknownPlugin(plugin_id.to_string()))?;
        tokio::fs::remove_dir_all(&root).await?;
        self.bus
            .emit_ipc("plugin_uninstalled", json!({"id": plugin_id}))
            .await?;
        Ok(())
    }

    /// Replace a plugin with a newer archive. Marketplace updates must be
    /// signed by the embedded root.
    pub async fn update(self: &Arc<Self>, plugin_id: &str, archive: &Path) -> HostResult<()> {
        if !self.plugins.contains_key(plugin_id) {
            return Err(HostError::UnknownPlugin(plugin_id.to_string()));
        }
        let staging = self
            .plugins_root
            .join(format!(".install-{}", uuid::Uuid::new_v4().simple()));
        extract::extract_archive(archive, &staging)?;

        let outcome = async {
            let manifest_text = std::fs::read_to_string(staging.join("manifest.json"))
                .map_err(|e| HostError::ManifestParse(format!("archive has no manifest: {e}")))?;
            let manifest = manifest::parse_manifest(&manifest_text)?;
            if manifest.id != plugin_id {
                return Err(HostError::ManifestInvariant(format!(
                    "update archive is for \"{}\"",
                    manifest.id
                )));
            }
            signature::verify(&manifest, &self.trust, TrustPolicy::EmbeddedOnly)?;
            integrity::verify_files(&staging, &manifest.files)?;
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        self.disable(plugin_id).await?;
        let target = self.plugins_root.join(plugin_id);
        extract::promote(&staging, &target)?;
        self.reload(plugin_id).await?;
        self.bus
            .emit_ipc("plugin_updated", json!({"id": plugin_id}))
            .await?;
        Ok(())
    }

    /// Restore the previous installed version from the backup store.
    pub async fn rollback(self: &Arc<Self>, plugin_id: &str) -> HostResult<()> {
        let root = {
            let instance = self
                .plugins
                .get(plugin_id)
                .ok_or_else(|| HostError::UnknownPlugin(plugin_id.to_string()))?;
            instance.root.clone()
        };
        self.disable(plugin_id).await?;
        extract::rollback(&root)?;
        self.reload(plugin_id).await?;
        self.bus
            .emit_ipc("plugin_updated", json!({"id": plugin_id, "rollback": true}))
            .await?;
        Ok(())
    }

    // -- refresh pipeline ---------------------------------------------------

    /// Run a plugin's default handler through rate limiter, cache,
    /// scheduler, and retry; record health; publish the artefact.
    pub async fn refresh_plugin(self: &Arc<Self>, plugin_id: &str) -> HostResult<Artefact> {
        let (manifest, config) = {
            let instance = self
                .plugins
                .get(plugin_id)
                .ok_or_else(|| HostError::UnknownPlugin(plugin_id.to_string()))?;
            if !instance.is_enabled() {
                return Err(HostError::UnsupportedApi(format!(
                    "plugin \"{plugin_id}\" is disabled"
                )));
            }
            (instance.manifest.clone(), instance.effective_config.clone())
        };

        self.rate_limiter.acquire(plugin_id)?;

        let key = fingerprint(
            plugin_id,
            &json!({
                "entry": manifest.entry,
                "version": manifest.version,
                "config": config,
            }),
        );

        let started = Instant::now();
        let owners = [plugin_id.to_string()];
        let host = Arc::clone(self);
        let id = plugin_id.to_string();
        let key_for_task = key.clone();
        let result = self
            .cache
            .get_or_compute(&key, &owners, None, move || async move {
                host.execute_refresh(&id, &key_for_task).await
            })
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(artefact) => {
                self.record_success(plugin_id, &key, latency_ms, &artefact)
                    .await;
                Ok(artefact)
            }
            Err(e) => {
                self.record_failure(plugin_id, latency_ms, &e).await;
                Err(e)
            }
        }
    }

    /// The cache-miss path: scheduler dispatch wrapping a retried sandbox
    /// execution.
    async fn execute_refresh(self: &Arc<Self>, plugin_id: &str, key: &str) -> HostResult<Artefact> {
        let host = Arc::clone(self);
        let id = plugin_id.to_string();
        self.scheduler
            .submit(plugin_id, key, move || {
                async move {
                    let data_type = {
                        let instance = host
                            .plugins
                            .get(&id)
                            .ok_or_else(|| HostError::UnknownPlugin(id.clone()))?;
                        instance.manifest.data_type
                    };
                    let output = host
                        .retry
                        .run(|attempt| {
                            let host = Arc::clone(&host);
                            let id = id.clone();
                            async move {
                                if attempt > 1 {
                                    tracing::debug!(plugin = %id, attempt, "refresh retry");
                                }
                                let (source, permissions, config) = host
                                    .execution_inputs(&id)
                                    .ok_or_else(|| HostError::Cancelled)?;
                                host.sandbox
                                    .execute(
                                        &id,
                                        &source,
                                        permissions,
                                        config,
                                        Invocation::Collect,
                                        None,
                                    )
                                    .await
                            }
                        })
                        .await?;

                    host.absorb_module_exports(&id, &output).await;
                    Artefact::from_value(data_type, output.value)
                        .map_err(HostError::JsException)
                }
                .boxed()
            })
            .await
    }

    /// Apply `subscribedEvents` / `exposedMethods` module exports, which
    /// override the manifest's declarations.
    async fn absorb_module_exports(self: &Arc<Self>, plugin_id: &str, output: &ExecutionOutput) {
        if let Some(subscriptions) = &output.subscribed_events {
            let new_set: HashSet<String> = subscriptions.iter().cloned().collect();
            let changed = {
                let instance = self.plugins.get(plugin_id);
                instance.map(|i| i.subscriptions != new_set).unwrap_or(false)
            };
            if changed {
                self.bus.unsubscribe_only(plugin_id).await;
                self.bus.subscribe(plugin_id, subscriptions).await;
                if let Some(mut instance) = self.plugins.get_mut(plugin_id) {
                    instance.subscriptions = new_set;
                }
            }
        }
        if let Some(methods) = &output.exposed_methods {
            let new_set: HashSet<String> = methods.iter().cloned().collect();
            let changed = {
                let instance = self.plugins.get(plugin_id);
                instance
                    .map(|i| i.exposed_methods != new_set)
                    .unwrap_or(false)
            };
            if changed {
                self.router.register_methods(plugin_id, new_set.clone());
                if let Some(mut instance) = self.plugins.get_mut(plugin_id) {
                    instance.exposed_methods = new_set;
                }
            }
        }
    }

    /// Refresh every enabled plugin; outcomes are collected, not dropped.
    pub async fn refresh_all(self: &Arc<Self>) -> Vec<(String, HostResult<Artefact>)> {
        let ids: Vec<String> = self
            .plugins
            .iter()
            .filter(|e| e.value().is_enabled())
            .map(|e| e.key().clone())
            .collect();
        let refreshes = ids.iter().map(|id| {
            let host = Arc::clone(self);
            let id = id.clone();
            async move {
                let outcome = host.refresh_plugin(&id).await;
                (id, outcome)
            }
        });
        futures_util::future::join_all(refreshes).await
    }

    async fn record_success(
        self: &Arc<Self>,
        plugin_id: &str,
        key: &str,
        latency_ms: u64,
        artefact: &Artefact,
    ) {
        let status_change = {
            let mut instance = match self.plugins.get_mut(plugin_id) {
                Some(instance) => instance,
                None => return,
            };
            let before = instance.health.status();
            instance.health.record_success(latency_ms);
            instance.last_artefact = Some(artefact.clone());
            instance.cache_keys.insert(key.to_string());
            let after = instance.health.status();
            (before != after).then_some(after)
        };

        let _ = self
            .bus
            .emit_ipc(
                "plugin_data_updated",
                json!({"id": plugin_id, "data": artefact}),
            )
            .await;
        self.emit_health_change(plugin_id, status_change).await;
    }

    async fn record_failure(self: &Arc<Self>, plugin_id: &str, latency_ms: u64, error: &HostError) {
        let status_change = {
            let mut instance = match self.plugins.get_mut(plugin_id) {
                Some(instance) => instance,
                None => return,
            };
            let before = instance.health.status();
            instance.health.record_failure(latency_ms, &error.to_string());
            let after = instance.health.status();
            (before != after).then_some(after)
        };

        self.report_plugin_error(plugin_id, error).await;
        self.emit_health_change(plugin_id, status_change).await;
    }

    async fn emit_health_change(&self, plugin_id: &str, change: Option<HealthStatus>) {
        if let Some(status) = change {
            let _ = self
                .bus
                .emit_ipc(
                    "plugin_health_changed",
                    json!({"id": plugin_id, "status": status}),
                )
                .await;
        }
    }

    async fn report_plugin_error(&self, plugin_id: &str, error: &HostError) {
        let _ = self
            .bus
            .emit_ipc(
                "plugin_error",
                json!({
                    "id": plugin_id,
                    "code": error.code(),
                    "message": error.to_string(),
                }),
            )
            .await;
    }

    // -- config -------------------------------------------------------------

    fn effective_config_for(&self, manifest: &PluginManifest) -> Value {
        let stored = self.storage.read_config(&manifest.id).ok().flatten();
        manifest::effective_config(manifest.config_schema.as_ref(), stored.as_ref())
    }

    pub fn get_plugin_config(&self, plugin_id: &str) -> HostResult<Value> {
        let instance = self
            .plugins
            .get(plugin_id)
            .ok_or_else(|| HostError::UnknownPlugin(plugin_id.to_string()))?;
        Ok(instance.effective_config.clone())
    }

    pub fn validate_plugin_config(&self, plugin_id: &str, config: &Value) -> HostResult<()> {
        match self.schemas.get(plugin_id) {
            Some(schema) => manifest::validate_config_value(&schema, config),
            None => {
                if self.plugins.contains_key(plugin_id) {
                    // No schema: any object is acceptable.
                    config
                        .as_object()
                        .map(|_| ())
                        .ok_or_else(|| HostError::ConfigInvalid("config must be an object".into()))
                } else {
                    Err(HostError::UnknownPlugin(plugin_id.to_string()))
                }
            }
        }
    }

    /// Validate, persist, and apply a new plugin config. The plugin is
    /// told through `onConfigChanged`, and its cached results are dropped
    /// because they were computed under the old config.
    pub async fn set_plugin_config(self: &Arc<Self>, plugin_id: &str, config: Value) -> HostResult<()> {
        self.validate_plugin_config(plugin_id, &config)?;
        self.storage.write_config(plugin_id, &config)?;

        let enabled = {
            let mut instance = self
                .plugins
                .get_mut(plugin_id)
                .ok_or_else(|| HostError::UnknownPlugin(plugin_id.to_string()))?;
            let schema = instance.manifest.config_schema.clone();
            instance.effective_config =
                manifest::effective_config(schema.as_ref(), Some(&config));
            instance.is_enabled()
        };
        self.cache.invalidate_plugin(plugin_id);

        if enabled {
            if let Some((source, permissions, effective)) = self.execution_inputs(plugin_id) {
                let result = self
                    .sandbox
                    .execute(
                        plugin_id,
                        &source,
                        permissions,
                        effective,
                        Invocation::ConfigChanged,
                        None,
                    )
                    .await;
                if let Err(e) = result {
                    tracing::warn!(plugin = plugin_id, "onConfigChanged failed: {e}");
                }
            }
        }
        Ok(())
    }

    // -- queries ------------------------------------------------------------

    pub fn list(&self) -> Vec<Value> {
        let mut rows: Vec<Value> = self.plugins.iter().map(|e| e.value().descriptor()).collect();
        rows.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        rows
    }

    pub fn get_plugin_data(&self, plugin_id: &str) -> HostResult<Option<Artefact>> {
        let instance = self
            .plugins
            .get(plugin_id)
            .ok_or_else(|| HostError::UnknownPlugin(plugin_id.to_string()))?;
        Ok(instance.last_artefact.clone())
    }

    pub fn get_all_data(&self) -> Value {
        let mut map = serde_json::Map::new();
        for entry in self.plugins.iter() {
            if let Some(artefact) = &entry.value().last_artefact {
                map.insert(
                    entry.key().clone(),
                    serde_json::to_value(artefact).unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(map)
    }

    pub fn get_plugin_health(&self, plugin_id: &str) -> HostResult<Value> {
        let instance = self
            .plugins
            .get(plugin_id)
            .ok_or_else(|| HostError::UnknownPlugin(plugin_id.to_string()))?;
        let health = &instance.health;
        Ok(json!({
            "id": plugin_id,
            "status": health.status(),
            "successCount": health.success_count,
            "failureCount": health.failure_count,
            "consecutiveFailures": health.consecutive_failures,
            "averageLatencyMs": health.average_latency_ms(),
            "lastSuccessAt": health.last_success_at,
            "lastError": health.last_error,
        }))
    }

    pub fn get_all_health(&self) -> Value {
        let mut map = serde_json::Map::new();
        for entry in self.plugins.iter() {
            if let Ok(health) = self.get_plugin_health(entry.key()) {
                map.insert(entry.key().clone(), health);
            }
        }
        Value::Object(map)
    }

    /// Installed (id, version) pairs, for update checks.
    pub fn installed_versions(&self) -> Vec<(String, String)> {
        self.plugins
            .iter()
            .map(|e| (e.key().clone(), e.value().manifest.version.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// Write a signed plugin directory under `root`, shared by tests across
/// the crate.
#[cfg(test)]
pub(crate) fn write_test_plugin(root: &Path, id: &str, entry_js: &str) -> PluginManifest {
    use crate::signature::sign_with_test_key;

    let mut manifest = crate::manifest::test_manifest();
    manifest.id = id.to_string();
    manifest.files = std::collections::BTreeMap::from([(
        "plugin.js".to_string(),
        format!("sha256:{}", integrity::sha256_hex(entry_js.as_bytes())),
    )]);
    let manifest = sign_with_test_key(manifest);

    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("plugin.js"), entry_js).unwrap();
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
    manifest
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
