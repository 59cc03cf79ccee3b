//! Control loop keeping executor schedules in line with stored definitions.
//!
//! Each pass reads every definition, schedules what is missing, moves or
//! re-wraps what changed, reschedules stale intervals and drops schedules
//! whose worker is gone. Failures are logged and retried on the next pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutorError, WorkerConfigError};
use crate::executor::Executor;
use crate::worker::{TickFn, WorkFactory, WorkerConfigStore, WorkerDefinition};

/// Schedule operations performed by one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scheduled: usize,
    /// Moved to a different executor.
    pub moved: usize,
    /// Re-wrapped in place after a plugin or resiliency change.
    pub rewrapped: usize,
    pub rescheduled: usize,
    pub removed: usize,
    /// Desired but left unscheduled this pass.
    pub skipped: usize,
}

impl ReconcileReport {
    /// Whether the pass changed no schedule.
    pub fn is_noop(&self) -> bool {
        self.scheduled + self.moved + self.rewrapped + self.rescheduled + self.removed == 0
    }
}

pub struct Reconciler {
    store: Arc<WorkerConfigStore>,
    factory: Arc<WorkFactory>,
    executors: Vec<Arc<dyn Executor>>,
    /// Definition each live tick was wrapped from.
    applied: Mutex<HashMap<String, WorkerDefinition>>,
    interval: Duration,
}

enum Placement {
    Placed,
    NotPlaced,
}

impl Reconciler {
    pub fn new(
        store: Arc<WorkerConfigStore>,
        factory: Arc<WorkFactory>,
        executors: Vec<Arc<dyn Executor>>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            factory,
            executors,
            applied: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn executors(&self) -> &[Arc<dyn Executor>] {
        &self.executors
    }

    pub fn executor_slugs(&self) -> Vec<String> {
        self.executors.iter().map(|e| e.slug().to_string()).collect()
    }

    fn executor(&self, slug: &str) -> Option<&Arc<dyn Executor>> {
        self.executors.iter().find(|e| e.slug() == slug)
    }

    /// Run one reconciliation pass.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, WorkerConfigError> {
        let desired = self.store.get_all().await?;
        let mut report = ReconcileReport::default();

        let mut live: HashMap<String, Arc<dyn Executor>> = HashMap::new();
        for executor in &self.executors {
            for worker_id in executor.list_scheduled_ids().await {
                if live.contains_key(&worker_id) {
                    warn!(worker_id = %worker_id, executor = executor.slug(), "Dropping duplicate schedule");
                    unschedule_logged(executor, &worker_id).await;
                    report.removed += 1;
                } else {
                    live.insert(worker_id, Arc::clone(executor));
                }
            }
        }

        let mut applied = self.applied.lock().await;
        for (worker_id, definition) in &desired {
            let current = live.remove(worker_id);

            let Some(target) = self.executor(&definition.executor_slug) else {
                warn!(
                    worker_id = %worker_id,
                    executor_slug = %definition.executor_slug,
                    "No executor with this slug, worker left unscheduled"
                );
                if let Some(current) = current {
                    unschedule_logged(&current, worker_id).await;
                    applied.remove(worker_id);
                    report.removed += 1;
                }
                report.skipped += 1;
                continue;
            };

            let needs_wrap = applied
                .get(worker_id)
                .is_none_or(|previous| previous.needs_rewrap(definition));

            match current {
                Some(current) if current.slug() == target.slug() && !needs_wrap => {
                    if current.interval_of(worker_id).await == Some(definition.interval_seconds) {
                        continue;
                    }
                    match current.reschedule(worker_id, definition.interval_seconds).await {
                        Ok(()) => {
                            applied.insert(worker_id.clone(), definition.clone());
                            report.rescheduled += 1;
                        }
                        Err(e @ ExecutorError::InvalidInterval { .. }) => {
                            warn!(worker_id = %worker_id, "Unscheduling worker: {e}");
                            unschedule_logged(&current, worker_id).await;
                            applied.remove(worker_id);
                            report.removed += 1;
                            report.skipped += 1;
                        }
                        Err(e) => {
                            warn!(worker_id = %worker_id, "Reschedule failed: {e}");
                            report.skipped += 1;
                        }
                    }
                }
                current => {
                    let moving = current
                        .as_ref()
                        .is_some_and(|c| c.slug() != target.slug());
                    let was_live = current.is_some();
                    match self
                        .place(worker_id, definition, target, current.as_ref())
                        .await
                    {
                        Placement::Placed => {
                            applied.insert(worker_id.clone(), definition.clone());
                            if moving {
                                report.moved += 1;
                            } else if was_live {
                                report.rewrapped += 1;
                            } else {
                                report.scheduled += 1;
                            }
                        }
                        Placement::NotPlaced => {
                            if was_live && !current_still_live(current.as_ref(), worker_id).await {
                                applied.remove(worker_id);
                                report.removed += 1;
                            }
                            report.skipped += 1;
                        }
                    }
                }
            }
        }

        for (worker_id, executor) in live {
            unschedule_logged(&executor, &worker_id).await;
            applied.remove(&worker_id);
            report.removed += 1;
            info!(worker_id = %worker_id, "Removed schedule of deleted worker");
        }
        applied.retain(|worker_id, _| desired.contains_key(worker_id));

        Ok(report)
    }

    /// Wrap and schedule on `target`, replacing any schedule on `current`.
    ///
    /// A move schedules on the new executor before dropping the old one, so a
    /// failed wrap or a full target keeps the worker running where it was.
    async fn place(
        &self,
        worker_id: &str,
        definition: &WorkerDefinition,
        target: &Arc<dyn Executor>,
        current: Option<&Arc<dyn Executor>>,
    ) -> Placement {
        let work = match self.factory.wrap(definition).await {
            Ok(Some(work)) => work,
            Ok(None) => return Placement::NotPlaced,
            Err(e) => {
                warn!(worker_id, "Worker setup failed, retrying next pass: {e}");
                return Placement::NotPlaced;
            }
        };
        if work.worker_id() != worker_id {
            warn!(
                worker_id,
                plugin_worker_id = work.worker_id(),
                "Plugin identity differs from stored worker id"
            );
        }

        if let Some(executor) = current.filter(|c| c.slug() == target.slug()) {
            return swap_in_place(executor, worker_id, definition, work.tick()).await;
        }

        if let Err(e) = target
            .schedule(worker_id, work.tick(), definition.interval_seconds)
            .await
        {
            warn!(worker_id, executor = target.slug(), "Cannot schedule worker: {e}");
            return Placement::NotPlaced;
        }

        if let Some(previous) = current {
            unschedule_logged(previous, worker_id).await;
        }
        Placement::Placed
    }

    /// Run passes until `cancel` fires, then shut every executor down.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval = ?self.interval, executors = ?self.executor_slugs(), "Reconciler started");
        loop {
            match self.reconcile_once().await {
                Ok(report) if !report.is_noop() => info!(?report, "Reconciled workers"),
                Ok(report) => debug!(?report, "Workers in sync"),
                Err(e) => error!("Reconciliation pass failed: {e}"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        for executor in &self.executors {
            executor.shutdown().await;
        }
        self.applied.lock().await.clear();
        info!("Reconciler stopped");
    }

    /// Spawn `run` as a background task.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

async fn unschedule_logged(executor: &Arc<dyn Executor>, worker_id: &str) {
    if let Err(e) = executor.unschedule(worker_id).await {
        warn!(worker_id, executor = executor.slug(), "Unschedule failed: {e}");
    }
}

/// Re-wrap on the same executor: the live schedule keeps running and picks
/// up the new tick after any tick in flight.
async fn swap_in_place(
    executor: &Arc<dyn Executor>,
    worker_id: &str,
    definition: &WorkerDefinition,
    tick: TickFn,
) -> Placement {
    if let Err(e) = executor.replace_tick(worker_id, tick).await {
        warn!(worker_id, executor = executor.slug(), "Cannot replace tick: {e}");
        return Placement::NotPlaced;
    }
    if executor.interval_of(worker_id).await == Some(definition.interval_seconds) {
        return Placement::Placed;
    }
    match executor
        .reschedule(worker_id, definition.interval_seconds)
        .await
    {
        Ok(()) => Placement::Placed,
        Err(e) => {
            warn!(worker_id, "Unscheduling worker: {e}");
            unschedule_logged(executor, worker_id).await;
            Placement::NotPlaced
        }
    }
}

async fn current_still_live(current: Option<&Arc<dyn Executor>>, worker_id: &str) -> bool {
    match current {
        Some(executor) => executor.is_scheduled(worker_id).await,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::WorkerError;
    use crate::executor::{NativeExecutor, ReducedExecutor};
    use crate::store::{Database, LibSqlBackend};
    use crate::worker::definition::{WorkerRecord, WorkerRuntimeState};
    use crate::worker::{LogSink, PluginCache, WorkContext, WorkContextFactory, Worker};

    struct EchoWorker {
        name: String,
        fail_setup: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Worker for EchoWorker {
        fn id(&self) -> String {
            self.name.clone()
        }

        async fn pre_work(&self, _ctx: &WorkContext) -> Result<(), WorkerError> {
            if self.fail_setup.load(Ordering::SeqCst) {
                return Err(WorkerError::failed("upstream unavailable"));
            }
            Ok(())
        }

        async fn work(&self, _ctx: &WorkContext) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    fn echo_module(
        fail_setup: Arc<AtomicBool>,
    ) -> impl Fn(&str, &[serde_json::Value]) -> anyhow::Result<Arc<dyn Worker>> + Send + Sync {
        move |_class, args| {
            let name = args
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or("echo")
                .to_string();
            Ok(Arc::new(EchoWorker {
                name,
                fail_setup: Arc::clone(&fail_setup),
            }) as Arc<dyn Worker>)
        }
    }

    struct FragileWorker {
        panic_setup: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Worker for FragileWorker {
        fn id(&self) -> String {
            "fragile".to_string()
        }

        async fn pre_work(&self, _ctx: &WorkContext) -> Result<(), WorkerError> {
            if self.panic_setup.load(Ordering::SeqCst) {
                panic!("setup exploded");
            }
            Ok(())
        }

        async fn work(&self, _ctx: &WorkContext) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    fn fragile_module(
        panic_setup: Arc<AtomicBool>,
    ) -> impl Fn(&str, &[serde_json::Value]) -> anyhow::Result<Arc<dyn Worker>> + Send + Sync {
        move |_class, _args| {
            Ok(Arc::new(FragileWorker {
                panic_setup: Arc::clone(&panic_setup),
            }) as Arc<dyn Worker>)
        }
    }

    struct Harness {
        reconciler: Reconciler,
        store: Arc<WorkerConfigStore>,
        backend: Arc<LibSqlBackend>,
        plugins: Arc<PluginCache>,
        native: Arc<NativeExecutor>,
        reduced: Arc<ReducedExecutor>,
        fail_setup: Arc<AtomicBool>,
        panic_setup: Arc<AtomicBool>,
    }

    async fn harness() -> Harness {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let plugins = Arc::new(PluginCache::new());
        let fail_setup = Arc::new(AtomicBool::new(false));
        let panic_setup = Arc::new(AtomicBool::new(false));
        plugins.register("echo", echo_module(fail_setup.clone())).await;
        plugins.register("fragile", fragile_module(panic_setup.clone())).await;

        let store = Arc::new(WorkerConfigStore::new(backend.clone(), plugins.clone()));
        let factory = Arc::new(WorkFactory::new(
            WorkContextFactory::new(backend.clone(), backend.clone()),
            plugins.clone(),
            store.clone(),
            Arc::new(LogSink),
            false,
        ));
        let native = Arc::new(NativeExecutor::new());
        let reduced = Arc::new(ReducedExecutor::new(1, 2));
        let executors: Vec<Arc<dyn Executor>> = vec![native.clone(), reduced.clone()];
        let reconciler = Reconciler::new(
            store.clone(),
            factory,
            executors,
            Duration::from_millis(20),
        );
        Harness {
            reconciler,
            store,
            backend,
            plugins,
            native,
            reduced,
            fail_setup,
            panic_setup,
        }
    }

    fn echo(name: &str) -> WorkerDefinition {
        WorkerDefinition::new("echo", "Echo", vec![serde_json::json!(name)], 60)
    }

    #[tokio::test]
    async fn schedules_then_second_pass_is_noop() {
        let h = harness().await;
        let id = h.store.add(echo("a")).await.unwrap();
        h.store.add(echo("b")).await.unwrap();

        let first = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(first.scheduled, 2);
        assert!(h.native.is_scheduled(&id).await);

        let second = h.reconciler.reconcile_once().await.unwrap();
        assert!(second.is_noop(), "{second:?}");
        assert_eq!(h.native.list_scheduled_ids().await.len(), 2);
        h.native.shutdown().await;
    }

    #[tokio::test]
    async fn removal_drops_live_schedule() {
        let h = harness().await;
        let id = h.store.add(echo("a")).await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();

        h.store.remove(&id).await.unwrap();
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!h.native.is_scheduled(&id).await);
        assert!(!h.reduced.is_scheduled(&id).await);
    }

    #[tokio::test]
    async fn executor_change_moves_schedule() {
        let h = harness().await;
        let id = h.store.add(echo("a")).await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();

        h.store.update_executor_slug(&id, "reduced").await.unwrap();
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.moved, 1);
        assert!(!h.native.is_scheduled(&id).await);
        assert!(h.reduced.is_scheduled(&id).await);

        assert!(h.reconciler.reconcile_once().await.unwrap().is_noop());
        h.reduced.shutdown().await;
    }

    #[tokio::test]
    async fn interval_change_reschedules_in_place() {
        let h = harness().await;
        let id = h.store.add(echo("a")).await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();

        h.store.update_interval_seconds(&id, 5).await.unwrap();
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.rescheduled, 1);
        assert_eq!(h.native.interval_of(&id).await, Some(5));
        h.native.shutdown().await;
    }

    #[tokio::test]
    async fn resiliency_change_rewraps() {
        let h = harness().await;
        let id = h.store.add(echo("a")).await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();

        h.store.update_error_resiliency(&id, 3).await.unwrap();
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.rewrapped, 1);
        assert!(h.native.is_scheduled(&id).await);
        assert!(h.reconciler.reconcile_once().await.unwrap().is_noop());
        h.native.shutdown().await;
    }

    #[tokio::test]
    async fn rewrap_keeps_single_timer() {
        let h = harness().await;
        let id = h.store.add(echo("a")).await.unwrap();
        h.store.update_executor_slug(&id, "reduced").await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();

        h.store.update_error_resiliency(&id, 3).await.unwrap();
        h.store.update_interval_seconds(&id, 15).await.unwrap();
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.rewrapped, 1);
        assert_eq!(h.reduced.list_scheduled_ids().await.len(), 1);
        assert_eq!(h.reduced.interval_of(&id).await, Some(15));
        assert_eq!(h.reduced.live_timers().await, 1);
        assert!(h.reconciler.reconcile_once().await.unwrap().is_noop());
        h.reduced.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_interval_leaves_worker_unscheduled() {
        let h = harness().await;
        let id = h.store.add(echo("a")).await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();

        h.store.update_interval_seconds(&id, 0).await.unwrap();
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!h.native.is_scheduled(&id).await);

        h.store.update_interval_seconds(&id, 30).await.unwrap();
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.scheduled, 1);
        h.native.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_executor_slug_is_skipped() {
        let h = harness().await;
        let id = h.store.add(echo("a")).await.unwrap();
        h.reconciler.reconcile_once().await.unwrap();

        h.store.update_executor_slug(&id, "nowhere").await.unwrap();
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.skipped, 1);
        assert!(!h.native.is_scheduled(&id).await);
    }

    #[tokio::test]
    async fn failed_setup_self_heals() {
        let h = harness().await;
        h.fail_setup.store(true, Ordering::SeqCst);
        let id = h.store.add(echo("a")).await.unwrap();

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(!h.native.is_scheduled(&id).await);

        h.fail_setup.store(false, Ordering::SeqCst);
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.scheduled, 1);
        assert!(h.native.is_scheduled(&id).await);
        h.native.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_setup_is_skipped_and_retried() {
        let h = harness().await;
        h.panic_setup.store(true, Ordering::SeqCst);
        let fragile = h
            .store
            .add(WorkerDefinition::new("fragile", "Fragile", vec![], 60))
            .await
            .unwrap();
        let echo_id = h.store.add(echo("b")).await.unwrap();

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.scheduled, 1);
        assert_eq!(report.skipped, 1);
        assert!(h.native.is_scheduled(&echo_id).await);
        assert!(!h.native.is_scheduled(&fragile).await);

        h.panic_setup.store(false, Ordering::SeqCst);
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.scheduled, 1);
        assert!(h.native.is_scheduled(&fragile).await);
        h.native.shutdown().await;
    }

    #[tokio::test]
    async fn run_survives_panicking_setup() {
        let h = harness().await;
        h.panic_setup.store(true, Ordering::SeqCst);
        h.store
            .add(WorkerDefinition::new("fragile", "Fragile", vec![], 60))
            .await
            .unwrap();
        let id = h.store.add(echo("b")).await.unwrap();
        let cancel = CancellationToken::new();
        let handle = Arc::new(h.reconciler).spawn(cancel.clone());

        for _ in 0..50 {
            if h.native.is_scheduled(&id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished());
        assert!(h.native.is_scheduled(&id).await);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(h.native.live_timers().await, 0);
    }

    #[tokio::test]
    async fn unregistered_module_heals_once_registered() {
        let h = harness().await;
        let record = WorkerRecord {
            worker_id: "broccoli.worker.ghost".to_string(),
            definition: WorkerDefinition::new("ghost", "Ghost", vec![serde_json::json!("ghost")], 60),
            runtime: WorkerRuntimeState::default(),
        };
        h.backend.insert_worker(&record).await.unwrap();

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.skipped, 1);

        h.plugins.register("ghost", echo_module(h.fail_setup.clone())).await;
        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.scheduled, 1);
        assert!(h.native.is_scheduled("broccoli.worker.ghost").await);
        h.native.shutdown().await;
    }

    #[tokio::test]
    async fn full_bounded_executor_keeps_old_schedule() {
        let h = harness().await;
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            ids.push(h.store.add(echo(name)).await.unwrap());
        }
        h.reconciler.reconcile_once().await.unwrap();
        for id in &ids {
            h.store.update_executor_slug(id, "reduced").await.unwrap();
        }

        let report = h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.moved, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.reduced.list_scheduled_ids().await.len(), 2);
        assert_eq!(h.native.list_scheduled_ids().await.len(), 1);
        h.native.shutdown().await;
        h.reduced.shutdown().await;
    }

    #[tokio::test]
    async fn run_stops_on_cancel_and_shuts_down_executors() {
        let h = harness().await;
        let id = h.store.add(echo("a")).await.unwrap();
        let reconciler = Arc::new(h.reconciler);
        let cancel = CancellationToken::new();
        let handle = reconciler.clone().spawn(cancel.clone());

        for _ in 0..50 {
            if h.native.is_scheduled(&id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.native.is_scheduled(&id).await);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(h.native.live_timers().await, 0);
        assert!(!h.native.is_scheduled(&id).await);
        assert_eq!(reconciler.executor_slugs(), vec!["native", "reduced"]);
    }
}
