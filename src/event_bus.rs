//! Prefixed pub/sub event plane.
//!
//! Topics follow a fixed grammar: `plugin:{id}:{action}` for plugin
//! emissions, `system:{action}` for the host, `ipc:{action}` for the shell,
//! with snake_case actions. Plugin handlers are registered by id. The bus
//! deliberately holds no plugin objects, only weak string identifiers, so
//! it can never keep a dead plugin alive.
//!
//! Emission enqueues onto a bounded channel consumed by a single dispatcher
//! task. Dispatch snapshots the matching handlers under the read lock,
//! releases it, and only then awaits the handlers (never holding a lock
//! across an await), with fan-out bounded by a semaphore. `ipc:` topics
//! bypass plugin handlers and go to the shell's broadcast channel.

use crate::error::{HostError, HostResult};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock, Semaphore};

lazy_static::lazy_static! {
    static ref SNAKE_ACTION: regex::Regex =
        regex::Regex::new(r"^[a-z][a-z0-9_]*$").unwrap();
}

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitter_plugin_id: Option<String>,
}

/// Handler a plugin id maps to. Receives `(topic, payload)`.
pub type EventHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Default, Clone, Serialize)]
pub struct BusStats {
    pub events_published: u64,
    pub events_dispatched: u64,
}

pub struct EventBus {
    /// topic → subscribed plugin ids.
    subscriptions: RwLock<HashMap<String, HashSet<String>>>,
    /// plugin id → handler. Survives `unsubscribe_only`.
    handlers: RwLock<HashMap<String, EventHandler>>,
    queue_tx: mpsc::Sender<Event>,
    /// Consumed exactly once by `start_dispatcher`; stop is terminal.
    queue_rx: parking_lot::Mutex<Option<mpsc::Receiver<Event>>>,
    dispatcher: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    stats: RwLock<BusStats>,
    ipc_tx: broadcast::Sender<Event>,
    fan_out: Arc<Semaphore>,
}

impl EventBus {
    pub fn new(queue_capacity: usize, max_concurrent_handlers: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        let (ipc_tx, _) = broadcast::channel(queue_capacity.max(1));
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: parking_lot::Mutex::new(Some(queue_rx)),
            dispatcher: parking_lot::Mutex::new(None),
            stats: RwLock::new(BusStats::default()),
            ipc_tx,
            fan_out: Arc::new(Semaphore::new(max_concurrent_handlers.max(1))),
        }
    }

    pub fn from_config(config: &crate::config::HostConfig) -> Self {
        Self::new(config.event_queue_capacity, config.max_concurrent_handlers)
    }

    // -- registration -------------------------------------------------------

    pub async fn subscribe(&self, plugin_id: &str, topics: &[String]) {
        let mut subs = self.subscriptions.write().await;
        for topic in topics {
            subs.entry(topic.clone())
                .or_default()
                .insert(plugin_id.to_string());
        }
    }

    pub async fn register_handler(&self, plugin_id: &str, handler: EventHandler) {
        self.handlers
            .write()
            .await
            .insert(plugin_id.to_string(), handler);
    }

    /// Remove a plugin's subscriptions but keep its handler slot, so a
    /// reload can re-subscribe without re-executing the plugin.
    pub async fn unsubscribe_only(&self, plugin_id: &str) {
        let mut subs = self.subscriptions.write().await;
        subs.retain(|_, ids| {
            ids.remove(plugin_id);
            !ids.is_empty()
        });
    }

    /// Full removal: subscriptions and handler. Used by uninstall.
    pub async fn remove_plugin(&self, plugin_id: &str) {
        self.unsubscribe_only(plugin_id).await;
        self.handlers.write().await.remove(plugin_id);
    }

    // -- emission -----------------------------------------------------------

    /// Async emit of a plugin-originated event.
    pub async fn emit(&self, plugin_id: &str, action: &str, payload: Value) -> HostResult<()> {
        let topic = plugin_topic(plugin_id, action)?;
        self.stats.write().await.events_published += 1;
        self.enqueue(Event {
            topic,
            payload,
            emitter_plugin_id: Some(plugin_id.to_string()),
        })
    }

    /// Sync flavour for non-async callers (sandbox callbacks). Uses
    /// `try_write` for the stats so a blocked writer cannot stall a
    /// callback; the enqueue itself is already non-blocking.
    pub fn emit_sync(&self, plugin_id: &str, action: &str, payload: Value) -> HostResult<()> {
        let topic = plugin_topic(plugin_id, action)?;
        if let Ok(mut stats) = self.stats.try_write() {
            stats.events_published += 1;
        }
        self.enqueue(Event {
            topic,
            payload,
            emitter_plugin_id: Some(plugin_id.to_string()),
        })
    }

    pub async fn emit_system(&self, action: &str, payload: Value) -> HostResult<()> {
        let topic = system_topic(action)?;
        self.stats.write().await.events_published += 1;
        self.enqueue(Event {
            topic,
            payload,
            emitter_plugin_id: None,
        })
    }

    pub fn emit_system_sync(&self, action: &str, payload: Value) -> HostResult<()> {
        let topic = system_topic(action)?;
        if let Ok(mut stats) = self.stats.try_write() {
            stats.events_published += 1;
        }
        self.enqueue(Event {
            topic,
            payload,
            emitter_plugin_id: None,
        })
    }

    /// Events addressed to the shell. Delivered over the broadcast channel
    /// only; plugin handlers never see `ipc:` topics.
    pub async fn emit_ipc(&self, action: &str, payload: Value) -> HostResult<()> {
        if !SNAKE_ACTION.is_match(action) {
            return Err(HostError::UnsupportedApi(format!(
                "event action \"{action}\" is not snake_case"
            )));
        }
        self.stats.write().await.events_published += 1;
        // No shell listening is fine; events are best-effort then.
        let _ = self.ipc_tx.send(Event {
            topic: format!("ipc:{action}"),
            payload,
            emitter_plugin_id: None,
        });
        Ok(())
    }

    /// Shell-side subscription to `ipc:` events.
    pub fn subscribe_ipc(&self) -> broadcast::Receiver<Event> {
        self.ipc_tx.subscribe()
    }

    fn enqueue(&self, event: Event) -> HostResult<()> {
        self.queue_tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                HostError::UnsupportedApi("event queue is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                HostError::UnsupportedApi("event bus is stopped".into())
            }
        })
    }

    // -- dispatch -----------------------------------------------------------

    /// Start the dispatcher exactly once. Returns `false` if it already ran
    /// (stop is terminal because the receive end is consumed, intentionally).
    pub fn start_dispatcher(self: &Arc<Self>) -> bool {
        let Some(mut rx) = self.queue_rx.lock().take() else {
            tracing::warn!("event dispatcher already started once; ignoring");
            return false;
        };
        let bus = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                bus.dispatch(event).await;
            }
        });
        *self.dispatcher.lock() = Some(handle);
        true
    }

    /// Stop dispatching. Terminal: the receiver was consumed by start.
    pub fn stop_dispatcher(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }

    async fn dispatch(&self, event: Event) {
        // Snapshot under the read locks, then release before any await.
        let targets: Vec<(String, EventHandler)> = {
            let subs = self.subscriptions.read().await;
            let Some(ids) = subs.get(&event.topic) else {
                return;
            };
            let handlers = self.handlers.read().await;
            ids.iter()
                .filter_map(|id| handlers.get(id).map(|h| (id.clone(), Arc::clone(h))))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        self.stats.write().await.events_dispatched += 1;

        let jobs = targets.into_iter().map(|(id, handler)| {
            let topic = event.topic.clone();
            let payload = event.payload.clone();
            let fan_out = Arc::clone(&self.fan_out);
            async move {
                // Closed only at process teardown.
                let Ok(_permit) = fan_out.acquire().await else {
                    return;
                };
                tracing::trace!(plugin = %id, topic = %topic, "delivering event");
                handler(topic, payload).await;
            }
        });
        futures_util::future::join_all(jobs).await;
    }

    pub async fn stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }

    /// Current subscriber set for a topic (test and supervision hook).
    pub async fn subscribers_of(&self, topic: &str) -> HashSet<String> {
        self.subscriptions
            .read()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

fn plugin_topic(plugin_id: &str, action: &str) -> HostResult<String> {
    if !SNAKE_ACTION.is_match(action) {
        return Err(HostError::UnsupportedApi(format!(
            "event action \"{action}\" is not snake_case"
        )));
    }
    Ok(format!("plugin:{plugin_id}:{action}"))
}

fn system_topic(action: &str) -> HostResult<String> {
    if !SNAKE_ACTION.is_match(action) {
        return Err(HostError::UnsupportedApi(format!(
            "event action \"{action}\" is not snake_case"
        )));
    }
    Ok(format!("system:{action}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
