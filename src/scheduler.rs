//! Bounded execution queue for plugin work.
//!
//! A FIFO queue with a hard capacity feeds a single worker loop that
//! acquires an owned semaphore permit, pops the next task, and spawns it
//! with the permit moved into the task. The finished task releases its
//! permit and nudges the worker's `Notify`, so a freed permit can never
//! strand queued work. The capacity check happens under the same lock as
//! the insertion, so there is no check/insert window.
//!
//! Every task runs inside a panic-catching wrapper: a panicking plugin
//! costs one `TaskPanic` outcome and a counter bump, never the host.

use crate::error::{HostError, HostResult};
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify, Semaphore};

/// A closure producing the task future, deferred so queued work costs
/// nothing until a permit frees up.
type TaskFn<R> = Box<dyn FnOnce() -> BoxFuture<'static, HostResult<R>> + Send>;

struct QueuedTask<R> {
    plugin_id: String,
    fingerprint: String,
    task: TaskFn<R>,
    submitted_at: Instant,
    reply: oneshot::Sender<HostResult<R>>,
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub total_submitted: AtomicU64,
    pub total_completed: AtomicU64,
    pub total_panicked: AtomicU64,
    pub active: AtomicUsize,
}

pub struct Scheduler<R> {
    queue: parking_lot::Mutex<VecDeque<QueuedTask<R>>>,
    capacity: usize,
    notify: Notify,
    permits: Arc<Semaphore>,
    shutting_down: AtomicBool,
    drain_timeout: Duration,
    pub stats: SchedulerStats,
}

impl<R: Send + 'static> Scheduler<R> {
    /// Build the scheduler and start its worker.
    pub fn new(capacity: usize, permits: usize, drain_timeout: Duration) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            queue: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            permits: Arc::new(Semaphore::new(permits.max(1))),
            shutting_down: AtomicBool::new(false),
            drain_timeout,
            stats: SchedulerStats::default(),
        });
        tokio::spawn(Self::worker(Arc::clone(&scheduler)));
        scheduler
    }

    pub fn from_config(config: &crate::config::HostConfig) -> Arc<Self> {
        Self::new(
            config.scheduler_queue_capacity,
            config.scheduler_permits,
            Duration::from_millis(config.scheduler_drain_timeout_ms),
        )
    }

    /// Queue one task and await its terminal outcome.
    pub async fn submit<F>(&self, plugin_id: &str, fingerprint: &str, task: F) -> HostResult<R>
    where
        F: FnOnce() -> BoxFuture<'static, HostResult<R>> + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(HostError::Cancelled);
        }

        let (reply, outcome) = oneshot::channel();
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                return Err(HostError::QueueFull {
                    capacity: self.capacity,
                });
            }
            queue.push_back(QueuedTask {
                plugin_id: plugin_id.to_string(),
                fingerprint: fingerprint.to_string(),
                task: Box::new(task),
                submitted_at: Instant::now(),
                reply,
            });
        }
        self.stats.total_submitted.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();

        // A dropped sender means the task was drained during shutdown
        // without a chance to report.
        outcome.await.unwrap_or(Err(HostError::Cancelled))
    }

    /// Submit a batch and collect every outcome, including submission
    /// failures. Nothing is silently dropped.
    pub async fn submit_many<F>(&self, tasks: Vec<(String, String, F)>) -> Vec<HostResult<R>>
    where
        F: FnOnce() -> BoxFuture<'static, HostResult<R>> + Send + 'static,
    {
        let submissions = tasks
            .into_iter()
            .map(|(plugin_id, fingerprint, task)| async move {
                self.submit(&plugin_id, &fingerprint, task).await
            });
        futures_util::future::join_all(submissions).await
    }

    async fn worker(self: Arc<Self>) {
        loop {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                // Semaphore closed: terminal shutdown.
                Err(_) => return,
            };

            let queued = loop {
                if let Some(task) = self.queue.lock().pop_front() {
                    break task;
                }
                if self.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                self.notify.notified().await;
            };

            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                scheduler.stats.active.fetch_add(1, Ordering::SeqCst);
                let wait_ms = queued.submitted_at.elapsed().as_millis() as u64;
                tracing::debug!(
                    plugin = %queued.plugin_id,
                    fingerprint = %queued.fingerprint,
                    wait_ms,
                    "task starting"
                );

                let outcome = match AssertUnwindSafe((queued.task)()).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        scheduler
                            .stats
                            .total_panicked
                            .fetch_add(1, Ordering::Relaxed);
                        Err(HostError::TaskPanic {
                            message: panic_message(panic),
                        })
                    }
                };

                scheduler.stats.active.fetch_sub(1, Ordering::SeqCst);
                scheduler
                    .stats
                    .total_completed
                    .fetch_add(1, Ordering::Relaxed);
                // The submitter may have gone away; that is not an error.
                let _ = queued.reply.send(outcome);

                drop(permit);
                scheduler.notify.notify_one();
            });
        }
    }

    /// Stop accepting work, cancel everything still queued, and give
    /// in-flight tasks a bounded window to finish.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.permits.close();

        let drained: Vec<QueuedTask<R>> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        for task in drained {
            let _ = task.reply.send(Err(HostError::Cancelled));
        }

        let deadline = Instant::now() + self.drain_timeout;
        while self.stats.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let leftover = self.stats.active.load(Ordering::SeqCst);
        if leftover > 0 {
            tracing::warn!(leftover, "shutdown drain timed out with tasks still running");
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
