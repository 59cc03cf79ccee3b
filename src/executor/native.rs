//! Unconstrained executor: one independent timer task per worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ExecutorError;
use crate::executor::{Executor, checked_interval};
use crate::worker::TickFn;

pub const NATIVE_EXECUTOR_SLUG: &str = "native";

struct ScheduledTimer {
    tick: Arc<Mutex<TickFn>>,
    interval_seconds: Arc<AtomicI64>,
    changed: Arc<Notify>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct NativeExecutor {
    slug: String,
    timers: Mutex<HashMap<String, ScheduledTimer>>,
    cancel: CancellationToken,
}

impl NativeExecutor {
    pub fn new() -> Self {
        Self {
            slug: NATIVE_EXECUTOR_SLUG.to_string(),
            timers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for NativeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_timer(
    worker_id: String,
    tick: Arc<Mutex<TickFn>>,
    interval_seconds: Arc<AtomicI64>,
    changed: Arc<Notify>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let secs = interval_seconds.load(Ordering::Relaxed).max(1) as u64;
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(worker_id = %worker_id, "Timer cancelled");
                    break;
                }
                _ = changed.notified() => continue,
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            }
            let current = Arc::clone(&*tick.lock().await);
            current().await;
        }
    })
}

#[async_trait]
impl Executor for NativeExecutor {
    fn slug(&self) -> &str {
        &self.slug
    }

    async fn schedule(
        &self,
        worker_id: &str,
        tick: TickFn,
        interval_seconds: i64,
    ) -> Result<(), ExecutorError> {
        checked_interval(worker_id, interval_seconds)?;
        let mut timers = self.timers.lock().await;
        if timers.contains_key(worker_id) {
            return Err(ExecutorError::AlreadyScheduled {
                slug: self.slug.clone(),
                worker_id: worker_id.to_string(),
            });
        }

        let tick = Arc::new(Mutex::new(tick));
        let interval = Arc::new(AtomicI64::new(interval_seconds));
        let changed = Arc::new(Notify::new());
        let cancel = self.cancel.child_token();
        let handle = spawn_timer(
            worker_id.to_string(),
            Arc::clone(&tick),
            Arc::clone(&interval),
            Arc::clone(&changed),
            cancel.clone(),
        );
        timers.insert(
            worker_id.to_string(),
            ScheduledTimer {
                tick,
                interval_seconds: interval,
                changed,
                cancel,
                handle,
            },
        );
        info!(executor = %self.slug, worker_id, interval_seconds, "Scheduled worker");
        Ok(())
    }

    async fn unschedule(&self, worker_id: &str) -> Result<(), ExecutorError> {
        let timer = self
            .timers
            .lock()
            .await
            .remove(worker_id)
            .ok_or_else(|| ExecutorError::NotScheduled {
                slug: self.slug.clone(),
                worker_id: worker_id.to_string(),
            })?;
        timer.cancel.cancel();
        info!(executor = %self.slug, worker_id, "Unscheduled worker");
        Ok(())
    }

    /// Restarts the pending wait with the new interval.
    async fn reschedule(&self, worker_id: &str, interval_seconds: i64) -> Result<(), ExecutorError> {
        checked_interval(worker_id, interval_seconds)?;
        let timers = self.timers.lock().await;
        let timer = timers
            .get(worker_id)
            .ok_or_else(|| ExecutorError::NotScheduled {
                slug: self.slug.clone(),
                worker_id: worker_id.to_string(),
            })?;
        timer
            .interval_seconds
            .store(interval_seconds, Ordering::Relaxed);
        timer.changed.notify_one();
        info!(executor = %self.slug, worker_id, interval_seconds, "Rescheduled worker");
        Ok(())
    }

    async fn replace_tick(&self, worker_id: &str, tick: TickFn) -> Result<(), ExecutorError> {
        let timers = self.timers.lock().await;
        let timer = timers
            .get(worker_id)
            .ok_or_else(|| ExecutorError::NotScheduled {
                slug: self.slug.clone(),
                worker_id: worker_id.to_string(),
            })?;
        *timer.tick.lock().await = tick;
        debug!(executor = %self.slug, worker_id, "Replaced tick");
        Ok(())
    }

    async fn is_scheduled(&self, worker_id: &str) -> bool {
        self.timers.lock().await.contains_key(worker_id)
    }

    async fn list_scheduled_ids(&self) -> HashSet<String> {
        self.timers.lock().await.keys().cloned().collect()
    }

    async fn interval_of(&self, worker_id: &str) -> Option<i64> {
        self.timers
            .lock()
            .await
            .get(worker_id)
            .map(|t| t.interval_seconds.load(Ordering::Relaxed))
    }

    async fn live_timers(&self) -> usize {
        self.timers
            .lock()
            .await
            .values()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let timers: Vec<ScheduledTimer> = self.timers.lock().await.drain().map(|(_, t)| t).collect();
        for timer in timers {
            let _ = timer.handle.await;
        }
        info!(executor = %self.slug, "Executor stopped");
    }
}
