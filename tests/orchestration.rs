//! End-to-end: store -> reconciler -> executor -> tick -> store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broccoli::admin::{AddWorkerRequest, WorkerAdmin};
use broccoli::builtin::register_builtins;
use broccoli::error::WorkerError;
use broccoli::executor::{Executor, NativeExecutor, ReducedExecutor};
use broccoli::reconciler::Reconciler;
use broccoli::store::{Database, LibSqlBackend};
use broccoli::worker::{
    ErrorSink, PluginCache, WorkContext, WorkContextFactory, WorkFactory, Worker,
    WorkerConfigStore,
};
use tokio::sync::Mutex;

struct Flaky;

#[async_trait]
impl Worker for Flaky {
    fn id(&self) -> String {
        "flaky".to_string()
    }

    async fn work(&self, _ctx: &WorkContext) -> Result<(), WorkerError> {
        Err(WorkerError::failed("source offline"))
    }
}

fn flaky_module()
-> impl Fn(&str, &[serde_json::Value]) -> anyhow::Result<Arc<dyn Worker>> + Send + Sync {
    |_class, _args| Ok(Arc::new(Flaky) as Arc<dyn Worker>)
}

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<String>>,
}

#[async_trait]
impl ErrorSink for RecordingSink {
    async fn report(&self, _error: &WorkerError, worker_id: &str) {
        self.reports.lock().await.push(worker_id.to_string());
    }
}

struct Clock {
    admin: WorkerAdmin,
    reconciler: Reconciler,
    backend: Arc<LibSqlBackend>,
    native: Arc<NativeExecutor>,
    reduced: Arc<ReducedExecutor>,
    sink: Arc<RecordingSink>,
}

async fn clock() -> Clock {
    let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let plugins = Arc::new(PluginCache::new());
    register_builtins(&plugins).await;
    plugins.register("flaky", flaky_module()).await;

    let store = Arc::new(WorkerConfigStore::new(backend.clone(), plugins.clone()));
    let sink = Arc::new(RecordingSink::default());
    let factory = Arc::new(WorkFactory::new(
        WorkContextFactory::new(backend.clone(), backend.clone()),
        plugins.clone(),
        store.clone(),
        sink.clone(),
        false,
    ));

    let native = Arc::new(NativeExecutor::new());
    let reduced = Arc::new(ReducedExecutor::new(1, 4));
    let executors: Vec<Arc<dyn Executor>> = vec![native.clone(), reduced.clone()];
    let admin = WorkerAdmin::new(
        store.clone(),
        backend.clone(),
        plugins,
        executors.iter().map(|e| e.slug().to_string()).collect(),
        "Integration",
    );
    let reconciler = Reconciler::new(store, factory, executors, Duration::from_secs(5));

    Clock {
        admin,
        reconciler,
        backend,
        native,
        reduced,
        sink,
    }
}

fn add_request(value: serde_json::Value) -> AddWorkerRequest {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn heartbeat_ticks_and_is_removed() {
    let clock = clock().await;
    let id = clock
        .admin
        .add_worker(add_request(serde_json::json!({
            "module": "heartbeat",
            "class_name": "Heartbeat",
            "args": ["it"],
            "interval_seconds": 1
        })))
        .await
        .unwrap();

    let report = clock.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.scheduled, 1);
    assert!(clock.native.is_scheduled(&id).await);

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let meta = clock.admin.get_worker_metadata(&id).await.unwrap();
    let ticks = meta["ticks"].as_i64().unwrap();
    assert!(ticks >= 1, "ticks = {ticks}");
    assert!(clock.admin.get_last_executed_at(&id).await.unwrap().is_some());
    assert_eq!(clock.admin.get_error_count(&id).await.unwrap(), 0);

    clock.admin.remove_worker(&id).await.unwrap();
    let report = clock.reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(!clock.native.is_scheduled(&id).await);
    assert!(!clock.reduced.is_scheduled(&id).await);
}

#[tokio::test]
async fn resiliency_applies_on_bounded_executor() {
    let clock = clock().await;
    let id = clock
        .admin
        .add_worker(add_request(serde_json::json!({
            "module": "flaky",
            "class_name": "Flaky",
            "interval_seconds": 1,
            "error_resiliency": 1,
            "executor_slug": "reduced"
        })))
        .await
        .unwrap();

    clock.reconciler.reconcile_once().await.unwrap();
    assert!(clock.reduced.is_scheduled(&id).await);
    assert!(!clock.native.is_scheduled(&id).await);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    clock.reduced.shutdown().await;

    let failures = clock.admin.get_error_count(&id).await.unwrap();
    assert!(failures >= 2, "failures = {failures}");
    let reports = clock.sink.reports.lock().await;
    assert_eq!(reports.len() as i64, failures - 1);
    assert!(reports.iter().all(|r| r == &id));
}

#[tokio::test]
async fn desired_state_survives_restart_of_the_loop() {
    let clock = clock().await;
    let id = clock
        .admin
        .add_worker(add_request(serde_json::json!({
            "module": "heartbeat",
            "class_name": "Heartbeat",
            "interval_seconds": 60
        })))
        .await
        .unwrap();
    clock.reconciler.reconcile_once().await.unwrap();
    clock.native.shutdown().await;
    assert!(clock.backend.get_worker(&id).await.unwrap().is_some());

    let native = Arc::new(NativeExecutor::new());
    let plugins = Arc::new(PluginCache::new());
    register_builtins(&plugins).await;
    let store = Arc::new(WorkerConfigStore::new(clock.backend.clone(), plugins.clone()));
    let factory = Arc::new(WorkFactory::new(
        WorkContextFactory::new(clock.backend.clone(), clock.backend.clone()),
        plugins,
        store.clone(),
        clock.sink.clone(),
        false,
    ));
    let restarted = Reconciler::new(
        store,
        factory,
        vec![native.clone() as Arc<dyn Executor>],
        Duration::from_secs(5),
    );

    let report = restarted.reconcile_once().await.unwrap();
    assert_eq!(report.scheduled, 1);
    assert!(native.is_scheduled(&id).await);
    assert!(restarted.reconcile_once().await.unwrap().is_noop());
    native.shutdown().await;
}
