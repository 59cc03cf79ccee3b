//! Scheduling back-ends that fire tick functions on a cadence.
//!
//! Executors are pure mechanism: they know nothing about resiliency or
//! pausing, which live in the tick itself. Firing is fixed-delay, so ticks of
//! one worker never overlap.

pub mod native;
pub mod reduced;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::worker::TickFn;

pub use native::NativeExecutor;
pub use reduced::ReducedExecutor;

/// A scheduling back-end.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Identifier matched against a worker's `executor_slug`.
    fn slug(&self) -> &str;

    /// Start firing `tick` every `interval_seconds`, first firing one interval from now.
    async fn schedule(
        &self,
        worker_id: &str,
        tick: TickFn,
        interval_seconds: i64,
    ) -> Result<(), ExecutorError>;

    /// Stop firing. An in-flight tick runs to completion.
    async fn unschedule(&self, worker_id: &str) -> Result<(), ExecutorError>;

    /// Change the interval of a live schedule, keeping its tick.
    async fn reschedule(&self, worker_id: &str, interval_seconds: i64) -> Result<(), ExecutorError>;

    /// Swap the tick of a live schedule. A tick already in flight finishes
    /// first and the next firing uses `tick`; the cadence is unchanged.
    async fn replace_tick(&self, worker_id: &str, tick: TickFn) -> Result<(), ExecutorError>;

    async fn is_scheduled(&self, worker_id: &str) -> bool;

    async fn list_scheduled_ids(&self) -> HashSet<String>;

    /// Interval of a live schedule, in seconds.
    async fn interval_of(&self, worker_id: &str) -> Option<i64>;

    /// Low-level timer tasks currently alive.
    async fn live_timers(&self) -> usize;

    /// Stop issuing ticks and wait for timer tasks to exit.
    async fn shutdown(&self);
}

/// Convert a stored interval into a positive duration.
pub(crate) fn checked_interval(
    worker_id: &str,
    interval_seconds: i64,
) -> Result<Duration, ExecutorError> {
    if interval_seconds <= 0 {
        return Err(ExecutorError::InvalidInterval {
            worker_id: worker_id.to_string(),
            interval_seconds,
        });
    }
    Ok(Duration::from_secs(interval_seconds as u64))
}
