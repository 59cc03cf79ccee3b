//! Turns a worker definition into a self-contained tick function.
//!
//! A tick honours the global pause switch, records its start time, runs the
//! worker inside its tracing span and applies error-resiliency accounting:
//! success resets the consecutive failure count, failure is reported once the
//! count reaches the worker's threshold and then increments it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::Instrument;

use crate::error::WorkerError;
use crate::worker::config_store::WorkerConfigStore;
use crate::worker::context::{WorkContext, WorkContextFactory};
use crate::worker::definition::{REPORT_EVERY_FAILURE, WorkerDefinition};
use crate::worker::plugin::{LoadedWorker, PluginCache, panic_message};
use crate::worker::reporting::ErrorSink;

/// Shared, repeatable tick. Executors call it once per due time.
pub type TickFn = Arc<dyn Fn() -> BoxFuture<'static, TickOutcome> + Send + Sync>;

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Workers are globally paused; nothing ran.
    Paused,
    Succeeded,
    /// The worker failed. `reported` is whether the sink was called.
    Failed { reported: bool },
}

/// A wrapped worker ready for an executor.
#[derive(Clone)]
pub struct WrappedWork {
    worker_id: String,
    tick: TickFn,
}

impl WrappedWork {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn tick(&self) -> TickFn {
        Arc::clone(&self.tick)
    }

    /// Run a single tick now.
    pub async fn run_once(&self) -> TickOutcome {
        (self.tick)().await
    }
}

struct TickRunner {
    worker_id: String,
    loaded: Arc<LoadedWorker>,
    ctx: WorkContext,
    store: Arc<WorkerConfigStore>,
    sink: Arc<dyn ErrorSink>,
    pause_workers: bool,
    error_resiliency: i64,
}

impl TickRunner {
    async fn run(&self) -> TickOutcome {
        if self.pause_workers {
            tracing::info!(worker_id = %self.worker_id, "Workers paused, skipping tick");
            return TickOutcome::Paused;
        }

        if let Err(e) = self.store.record_execution(&self.worker_id, Utc::now()).await {
            tracing::warn!(worker_id = %self.worker_id, "Failed to record execution time: {e}");
        }

        let result = AssertUnwindSafe(self.loaded.worker().work(&self.ctx))
            .catch_unwind()
            .instrument(self.ctx.span().clone())
            .await
            .unwrap_or_else(|panic| Err(WorkerError::Panicked(panic_message(panic.as_ref()))));

        match result {
            Ok(()) => {
                if let Err(e) = self.store.reset_error_count(&self.worker_id).await {
                    tracing::warn!(worker_id = %self.worker_id, "Failed to reset error count: {e}");
                }
                TickOutcome::Succeeded
            }
            Err(error) => TickOutcome::Failed {
                reported: self.handle_failure(&error).await,
            },
        }
    }

    async fn handle_failure(&self, error: &WorkerError) -> bool {
        if self.error_resiliency == REPORT_EVERY_FAILURE {
            self.sink.report(error, &self.worker_id).await;
            return true;
        }

        let reported = match self.store.get_error_count(&self.worker_id).await {
            Ok(count) => count >= self.error_resiliency,
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, "Failed to read error count: {e}");
                true
            }
        };

        if reported {
            self.sink.report(error, &self.worker_id).await;
        } else {
            tracing::info!(
                worker_id = %self.worker_id,
                error = %error,
                "Worker failed below resiliency threshold"
            );
        }

        if let Err(e) = self.store.increment_error_count(&self.worker_id).await {
            tracing::warn!(worker_id = %self.worker_id, "Failed to increment error count: {e}");
        }
        reported
    }
}

/// Builds `WrappedWork` from definitions.
pub struct WorkFactory {
    contexts: WorkContextFactory,
    plugins: Arc<PluginCache>,
    store: Arc<WorkerConfigStore>,
    sink: Arc<dyn ErrorSink>,
    pause_workers: bool,
}

impl WorkFactory {
    pub fn new(
        contexts: WorkContextFactory,
        plugins: Arc<PluginCache>,
        store: Arc<WorkerConfigStore>,
        sink: Arc<dyn ErrorSink>,
        pause_workers: bool,
    ) -> Self {
        Self {
            contexts,
            plugins,
            store,
            sink,
            pause_workers,
        }
    }

    /// Wrap a definition.
    ///
    /// Returns `Ok(None)` when the plugin cannot be resolved (logged). A failing
    /// or panicking `pre_work` is returned as an error; it runs at most once
    /// successfully per cached instance.
    pub async fn wrap(
        &self,
        definition: &WorkerDefinition,
    ) -> Result<Option<WrappedWork>, WorkerError> {
        let loaded = match self
            .plugins
            .load(&definition.module, &definition.class_name, &definition.args)
            .await
        {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!(
                    module = %definition.module,
                    class_name = %definition.class_name,
                    "Cannot wrap worker: {e}"
                );
                return Ok(None);
            }
        };

        let worker_id = loaded.worker_id();
        let ctx = self.contexts.build(&worker_id);
        loaded
            .prepare(&ctx)
            .instrument(ctx.span().clone())
            .await?;

        let runner = Arc::new(TickRunner {
            worker_id: worker_id.clone(),
            loaded,
            ctx,
            store: Arc::clone(&self.store),
            sink: Arc::clone(&self.sink),
            pause_workers: self.pause_workers,
            error_resiliency: definition.error_resiliency,
        });
        let tick: TickFn = Arc::new(move || {
            let runner = Arc::clone(&runner);
            async move { runner.run().await }.boxed()
        });

        Ok(Some(WrappedWork { worker_id, tick }))
    }
}
