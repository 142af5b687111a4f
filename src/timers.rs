//! Cancellable scheduled callbacks for plugins.
//!
//! The hard part is the window between scheduling and cancellation: a timer
//! id exists (and may be cancelled) before its entry lands in the live
//! table. The registry closes it with a two-table handshake. `reserve`
//! creates a pending cancel token; `activate` moves the id from the pending
//! table into the live table, and both tables are only ever touched while
//! holding the async `timers` mutex, which makes activation and any
//! observation of cancellation strictly ordered. A cancelled pending id
//! makes `activate` return `false` and the callback never runs.
//!
//! The pending table itself sits behind a sync mutex recovered from
//! poisoning: a panic while holding it loses nothing but plain data, which
//! is logged and reused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One-shot or repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Timeout,
    Interval,
}

/// Host-side callback invoked when a timer fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

type CancelFlag = Arc<AtomicBool>;

struct TimerEntry {
    plugin_id: String,
    cancel: CancelFlag,
    handle: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
pub struct TimerRegistry {
    next_id: AtomicU64,
    timers: tokio::sync::Mutex<HashMap<u64, TimerEntry>>,
    /// id → (owner, token) for timers reserved but not yet activated.
    /// Always manipulated while holding the `timers` mutex.
    pending_tokens: std::sync::Mutex<HashMap<u64, (String, CancelFlag)>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, (String, CancelFlag)>> {
        self.pending_tokens.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("pending timer table poisoned; reusing data");
            poisoned.into_inner()
        })
    }

    /// Allocate a timer id with a pending cancel token. The id is
    /// cancellable from this moment on.
    pub async fn reserve(&self, plugin_id: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let flag: CancelFlag = Arc::new(AtomicBool::new(false));
        let _table = self.timers.lock().await;
        self.lock_pending()
            .insert(id, (plugin_id.to_string(), flag));
        id
    }

    /// Arm a reserved timer. Returns `false` if the id was cancelled while
    /// pending; in that case the callback will never run.
    pub async fn activate(
        self: &Arc<Self>,
        id: u64,
        kind: TimerKind,
        delay: Duration,
        callback: TimerCallback,
    ) -> bool {
        let mut table = self.timers.lock().await;
        let Some((plugin_id, cancel)) = self.lock_pending().remove(&id) else {
            return false;
        };

        let registry = Arc::clone(self);
        let flag = Arc::clone(&cancel);
        let handle = tokio::spawn(async move {
            match kind {
                TimerKind::Timeout => {
                    tokio::time::sleep(delay).await;
                    // Taking the entry out of the live table is the
                    // arbitration point between firing and cancellation:
                    // if cancel removed it first, cancel returned true and
                    // the callback must not run.
                    let won = registry.timers.lock().await.remove(&id).is_some();
                    if won && !flag.load(Ordering::SeqCst) {
                        callback();
                    }
                }
                TimerKind::Interval => loop {
                    tokio::time::sleep(delay).await;
                    let live = registry.timers.lock().await.contains_key(&id);
                    if !live || flag.load(Ordering::SeqCst) {
                        break;
                    }
                    callback();
                },
            }
        });

        table.insert(
            id,
            TimerEntry {
                plugin_id,
                cancel,
                handle,
            },
        );
        true
    }

    /// Reserve and arm in one step. Returns the timer id.
    pub async fn schedule(
        self: &Arc<Self>,
        plugin_id: &str,
        kind: TimerKind,
        delay: Duration,
        callback: TimerCallback,
    ) -> u64 {
        let id = self.reserve(plugin_id).await;
        // Only a concurrent cancel can make this fail, in which case the
        // id is already dead and returning it is still correct.
        let _ = self.activate(id, kind, delay, callback).await;
        id
    }

    /// Cancel a timer wherever it currently lives. Returns `true` iff the
    /// id was observed in either table, so cancel-then-activate and
    /// activate-then-cancel are both safe.
    pub async fn cancel(&self, id: u64) -> bool {
        let mut table = self.timers.lock().await;
        let mut found = false;
        if let Some(entry) = table.remove(&id) {
            entry.cancel.store(true, Ordering::SeqCst);
            entry.handle.abort();
            found = true;
        }
        if let Some((_, flag)) = self.lock_pending().remove(&id) {
            flag.store(true, Ordering::SeqCst);
            found = true;
        }
        found
    }

    /// Cancel every timer owned by a plugin. Invoked on disable and
    /// uninstall.
    pub async fn cancel_all_for(&self, plugin_id: &str) {
        let mut table = self.timers.lock().await;
        let doomed: Vec<u64> = table
            .iter()
            .filter(|(_, e)| e.plugin_id == plugin_id)
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            if let Some(entry) = table.remove(&id) {
                entry.cancel.store(true, Ordering::SeqCst);
                entry.handle.abort();
            }
        }
        self.lock_pending().retain(|_, (owner, flag)| {
            if owner == plugin_id {
                flag.store(true, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
    }

    /// Live timer ids owned by a plugin.
    pub async fn ids_for(&self, plugin_id: &str) -> Vec<u64> {
        let table = self.timers.lock().await;
        table
            .iter()
            .filter(|(_, e)| e.plugin_id == plugin_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of live (activated, not yet fired or cancelled) timers.
    pub async fn active_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_callback() -> (TimerCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let cb: TimerCallback = Arc::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (cb, count)
    }

    #[tokio::test]
    async fn timeout_fires_once_and_cleans_up() {
        let registry = Arc::new(TimerRegistry::new());
        let (cb, fired) = counter_callback();
        registry
            .schedule("p", TimerKind::Timeout, Duration::from_millis(10), cb)
            .await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn interval_fires_repeatedly_until_cancelled() {
        let registry = Arc::new(TimerRegistry::new());
        let (cb, fired) = counter_callback();
        let id = registry
            .schedule("p", TimerKind::Interval, Duration::from_millis(10), cb)
            .await;

        tokio::time::sleep(Duration::from_millis(65)).await;
        assert!(registry.cancel(id).await);
        let seen = fired.load(Ordering::SeqCst);
        assert!(seen >= 2, "interval fired only {seen} times");

        // No further firings after cancel.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let registry = Arc::new(TimerRegistry::new());
        let (cb, fired) = counter_callback();
        let id = registry
            .schedule("p", TimerKind::Timeout, Duration::from_millis(30), cb)
            .await;

        assert!(registry.cancel(id).await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn double_cancel_returns_true_then_false() {
        let registry = Arc::new(TimerRegistry::new());
        let (cb, _) = counter_callback();
        let id = registry
            .schedule("p", TimerKind::Timeout, Duration::from_secs(10), cb)
            .await;

        assert!(registry.cancel(id).await);
        assert!(!registry.cancel(id).await);
    }

    #[tokio::test]
    async fn cancel_of_unknown_id_is_false() {
        let registry = Arc::new(TimerRegistry::new());
        assert!(!registry.cancel(12345).await);
    }

    #[tokio::test]
    async fn cancel_between_reserve_and_activate_wins() {
        let registry = Arc::new(TimerRegistry::new());
        let (cb, fired) = counter_callback();

        let id = registry.reserve("p").await;
        assert!(registry.cancel(id).await);
        let armed = registry
            .activate(id, TimerKind::Timeout, Duration::from_millis(5), cb)
            .await;
        assert!(!armed);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_activate_race_is_always_coherent() {
        let registry = Arc::new(TimerRegistry::new());

        for _ in 0..100 {
            let (cb, fired) = counter_callback();
            let id = registry.reserve("p").await;

            let r1 = Arc::clone(&registry);
            let activate = tokio::spawn(async move {
                r1.activate(id, TimerKind::Timeout, Duration::from_millis(1), cb)
                    .await
            });
            let r2 = Arc::clone(&registry);
            let cancel = tokio::spawn(async move { r2.cancel(id).await });

            let armed = activate.await.unwrap();
            let cancelled = cancel.await.unwrap();

            // Exactly one of the two must have observed the other.
            assert!(
                cancelled || armed,
                "both cancel and activate claim to have lost"
            );
            if cancelled {
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert_eq!(
                    fired.load(Ordering::SeqCst),
                    0,
                    "callback ran despite a successful cancel"
                );
            }
            // Leave no timer behind for the next round.
            let _ = registry.cancel(id).await;
        }
    }

    #[tokio::test]
    async fn cancel_all_for_spares_other_plugins() {
        let registry = Arc::new(TimerRegistry::new());
        let (cb_a, fired_a) = counter_callback();
        let (cb_b, fired_b) = counter_callback();

        registry
            .schedule("a", TimerKind::Timeout, Duration::from_millis(30), cb_a)
            .await;
        registry
            .schedule("b", TimerKind::Timeout, Duration::from_millis(30), cb_b)
            .await;

        registry.cancel_all_for("a").await;
        assert!(registry.ids_for("a").await.is_empty());
        assert_eq!(registry.ids_for("b").await.len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired_a.load(Ordering::SeqCst), 0);
        assert_eq!(fired_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let registry = Arc::new(TimerRegistry::new());
        let (cb, _) = counter_callback();
        let a = registry
            .schedule("p", TimerKind::Timeout, Duration::from_secs(5), Arc::clone(&cb))
            .await;
        let b = registry
            .schedule("p", TimerKind::Timeout, Duration::from_secs(5), cb)
            .await;
        assert!(b > a);
        registry.cancel_all_for("p").await;
    }
}
