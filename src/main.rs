use std::sync::Arc;

use broccoli::builtin;
use broccoli::config::OrchestratorConfig;
use broccoli::executor::{Executor, NativeExecutor, ReducedExecutor};
use broccoli::reconciler::Reconciler;
use broccoli::store::LibSqlBackend;
use broccoli::worker::reporting::sink_from_config;
use broccoli::worker::{PluginCache, WorkContextFactory, WorkFactory, WorkerConfigStore};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OrchestratorConfig::from_env()?;

    eprintln!("🥦 Broccoli clock v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Instance: {}", config.instance_title);
    eprintln!("   Database: {}", config.db_path.display());
    if config.pause_workers {
        eprintln!("   Workers are PAUSED");
    }

    let backend = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);

    let plugins = Arc::new(PluginCache::new());
    builtin::register_builtins(&plugins).await;

    let store = Arc::new(WorkerConfigStore::new(backend.clone(), plugins.clone()));
    let factory = Arc::new(WorkFactory::new(
        WorkContextFactory::new(backend.clone(), backend.clone()),
        plugins.clone(),
        store.clone(),
        sink_from_config(&config),
        config.pause_workers,
    ));

    let mut executors: Vec<Arc<dyn Executor>> = vec![Arc::new(NativeExecutor::new())];
    if let Some(max_jobs) = config.reduced_max_jobs {
        executors.push(Arc::new(ReducedExecutor::new(
            max_jobs,
            config.reduced_workers_per_slot,
        )));
    }

    let reconciler = Arc::new(Reconciler::new(
        store,
        factory,
        executors,
        config.reconcile_interval,
    ));
    tracing::info!(
        executors = ?reconciler.executor_slugs(),
        modules = ?plugins.module_names().await,
        "Clock started"
    );

    let cancel = CancellationToken::new();
    let handle = reconciler.spawn(cancel.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    cancel.cancel();
    handle.await?;

    Ok(())
}
