//! Capacity-bounded executor.
//!
//! At most `max_jobs` slot tasks ever exist. Each slot multiplexes up to
//! `workers_per_slot` workers: it sleeps until the earliest due worker, runs
//! its tick, then pushes that worker's due time one interval past completion.
//! Workers sharing a slot run one after another, so a slow tick delays its
//! neighbours but never the rest of the process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ExecutorError;
use crate::executor::{Executor, checked_interval};
use crate::worker::TickFn;

pub const REDUCED_EXECUTOR_SLUG: &str = "reduced";

struct SlotEntry {
    tick: TickFn,
    interval: Duration,
    interval_seconds: i64,
    next_due: Instant,
}

#[derive(Default)]
struct Slot {
    entries: Mutex<HashMap<String, SlotEntry>>,
    changed: Notify,
}

impl Slot {
    /// Earliest due worker, if any.
    async fn next_due(&self) -> Option<(String, Instant)> {
        self.entries
            .lock()
            .await
            .iter()
            .min_by_key(|(_, entry)| entry.next_due)
            .map(|(id, entry)| (id.clone(), entry.next_due))
    }

    async fn fire(&self, worker_id: &str) {
        let tick = match self.entries.lock().await.get(worker_id) {
            Some(entry) if entry.next_due <= Instant::now() => Arc::clone(&entry.tick),
            _ => return,
        };

        tick().await;

        if let Some(entry) = self.entries.lock().await.get_mut(worker_id) {
            entry.next_due = Instant::now() + entry.interval;
        }
    }

    async fn run(self: Arc<Self>, index: usize, cancel: CancellationToken) {
        loop {
            match self.next_due().await {
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.changed.notified() => {}
                    }
                }
                Some((worker_id, due)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.changed.notified() => {}
                        _ = tokio::time::sleep_until(due) => self.fire(&worker_id).await,
                    }
                }
            }
        }
        debug!(slot = index, "Slot stopped");
    }
}

struct SlotState {
    slot: Arc<Slot>,
    /// Spawned on first use.
    handle: Option<JoinHandle<()>>,
}

struct Assignments {
    slots: Vec<SlotState>,
    /// worker_id -> slot index
    owners: HashMap<String, usize>,
}

pub struct ReducedExecutor {
    slug: String,
    max_jobs: usize,
    workers_per_slot: usize,
    state: Mutex<Assignments>,
    cancel: CancellationToken,
}

impl ReducedExecutor {
    /// `max_jobs` bounds the timer tasks; `workers_per_slot` bounds how many
    /// workers share one.
    pub fn new(max_jobs: usize, workers_per_slot: usize) -> Self {
        let slots = (0..max_jobs)
            .map(|_| SlotState {
                slot: Arc::new(Slot::default()),
                handle: None,
            })
            .collect();
        Self {
            slug: REDUCED_EXECUTOR_SLUG.to_string(),
            max_jobs,
            workers_per_slot: workers_per_slot.max(1),
            state: Mutex::new(Assignments {
                slots,
                owners: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// Total workers this executor accepts.
    pub fn capacity(&self) -> usize {
        self.max_jobs * self.workers_per_slot
    }

    fn not_scheduled(&self, worker_id: &str) -> ExecutorError {
        ExecutorError::NotScheduled {
            slug: self.slug.clone(),
            worker_id: worker_id.to_string(),
        }
    }
}

#[async_trait]
impl Executor for ReducedExecutor {
    fn slug(&self) -> &str {
        &self.slug
    }

    async fn schedule(
        &self,
        worker_id: &str,
        tick: TickFn,
        interval_seconds: i64,
    ) -> Result<(), ExecutorError> {
        let interval = checked_interval(worker_id, interval_seconds)?;
        let mut state = self.state.lock().await;
        if state.owners.contains_key(worker_id) {
            return Err(ExecutorError::AlreadyScheduled {
                slug: self.slug.clone(),
                worker_id: worker_id.to_string(),
            });
        }

        let mut load = vec![0usize; state.slots.len()];
        for index in state.owners.values() {
            load[*index] += 1;
        }
        let index = load
            .iter()
            .enumerate()
            .filter(|(_, count)| **count < self.workers_per_slot)
            .min_by_key(|(_, count)| **count)
            .map(|(index, _)| index)
            .ok_or_else(|| ExecutorError::CapacityExceeded {
                slug: self.slug.clone(),
                capacity: self.capacity(),
            })?;

        let slot_state = &mut state.slots[index];
        let slot = Arc::clone(&slot_state.slot);
        slot.entries.lock().await.insert(
            worker_id.to_string(),
            SlotEntry {
                tick,
                interval,
                interval_seconds,
                next_due: Instant::now() + interval,
            },
        );
        slot.changed.notify_one();
        if slot_state.handle.is_none() {
            let cancel = self.cancel.child_token();
            slot_state.handle = Some(tokio::spawn(Arc::clone(&slot).run(index, cancel)));
            debug!(executor = %self.slug, slot = index, "Started slot");
        }
        state.owners.insert(worker_id.to_string(), index);

        info!(executor = %self.slug, worker_id, interval_seconds, slot = index, "Scheduled worker");
        Ok(())
    }

    async fn unschedule(&self, worker_id: &str) -> Result<(), ExecutorError> {
        let mut state = self.state.lock().await;
        let index = state
            .owners
            .remove(worker_id)
            .ok_or_else(|| self.not_scheduled(worker_id))?;
        let slot = &state.slots[index].slot;
        slot.entries.lock().await.remove(worker_id);
        slot.changed.notify_one();
        info!(executor = %self.slug, worker_id, "Unscheduled worker");
        Ok(())
    }

    async fn reschedule(&self, worker_id: &str, interval_seconds: i64) -> Result<(), ExecutorError> {
        let interval = checked_interval(worker_id, interval_seconds)?;
        let state = self.state.lock().await;
        let index = *state
            .owners
            .get(worker_id)
            .ok_or_else(|| self.not_scheduled(worker_id))?;
        let slot = &state.slots[index].slot;
        if let Some(entry) = slot.entries.lock().await.get_mut(worker_id) {
            entry.interval = interval;
            entry.interval_seconds = interval_seconds;
            entry.next_due = Instant::now() + interval;
        }
        slot.changed.notify_one();
        info!(executor = %self.slug, worker_id, interval_seconds, "Rescheduled worker");
        Ok(())
    }

    async fn replace_tick(&self, worker_id: &str, tick: TickFn) -> Result<(), ExecutorError> {
        let state = self.state.lock().await;
        let index = *state
            .owners
            .get(worker_id)
            .ok_or_else(|| self.not_scheduled(worker_id))?;
        let mut entries = state.slots[index].slot.entries.lock().await;
        let entry = entries
            .get_mut(worker_id)
            .ok_or_else(|| self.not_scheduled(worker_id))?;
        entry.tick = tick;
        debug!(executor = %self.slug, worker_id, slot = index, "Replaced tick");
        Ok(())
    }

    async fn is_scheduled(&self, worker_id: &str) -> bool {
        self.state.lock().await.owners.contains_key(worker_id)
    }

    async fn list_scheduled_ids(&self) -> HashSet<String> {
        self.state.lock().await.owners.keys().cloned().collect()
    }

    async fn interval_of(&self, worker_id: &str) -> Option<i64> {
        let state = self.state.lock().await;
        let index = *state.owners.get(worker_id)?;
        state.slots[index]
            .slot
            .entries
            .lock()
            .await
            .get(worker_id)
            .map(|entry| entry.interval_seconds)
    }

    async fn live_timers(&self) -> usize {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .filter(|s| s.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .count()
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock().await;
            state.owners.clear();
            state.slots.iter_mut().filter_map(|s| s.handle.take()).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!(executor = %self.slug, "Executor stopped");
    }
}
