//! Worker plugin contract and the registry/cache that builds worker instances.
//!
//! Modules are registered by name at startup. `load` looks the module up,
//! asks it to construct `class_name` with `args`, and memoizes the result by
//! `(module, class_name, args)` so repeated reconciliation passes reuse the
//! same instance and never repeat its one-time setup.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, OnceCell, RwLock};

use crate::error::{PluginError, WorkerError};
use crate::worker::context::WorkContext;
use crate::worker::definition::worker_id_for;

/// A pluggable, periodically invoked unit of work.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable identity; namespaced into the `worker_id`.
    fn id(&self) -> String;

    /// One-time setup, run before the first tick is scheduled.
    async fn pre_work(&self, _ctx: &WorkContext) -> Result<(), WorkerError> {
        Ok(())
    }

    /// One tick of work.
    async fn work(&self, ctx: &WorkContext) -> Result<(), WorkerError>;
}

/// Constructor for the worker types a module provides.
pub trait WorkerModule: Send + Sync {
    fn construct(
        &self,
        class_name: &str,
        args: &[serde_json::Value],
    ) -> anyhow::Result<Arc<dyn Worker>>;
}

impl<F> WorkerModule for F
where
    F: Fn(&str, &[serde_json::Value]) -> anyhow::Result<Arc<dyn Worker>> + Send + Sync,
{
    fn construct(
        &self,
        class_name: &str,
        args: &[serde_json::Value],
    ) -> anyhow::Result<Arc<dyn Worker>> {
        self(class_name, args)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PluginKey {
    module: String,
    class_name: String,
    /// Canonical JSON of the argument list.
    args: String,
}

impl PluginKey {
    fn new(module: &str, class_name: &str, args: &[serde_json::Value]) -> Self {
        Self {
            module: module.to_string(),
            class_name: class_name.to_string(),
            args: serde_json::Value::Array(args.to_vec()).to_string(),
        }
    }
}

/// A cached worker instance plus its one-time setup state.
pub struct LoadedWorker {
    worker: Arc<dyn Worker>,
    prepared: OnceCell<()>,
}

impl LoadedWorker {
    fn new(worker: Arc<dyn Worker>) -> Self {
        Self {
            worker,
            prepared: OnceCell::new(),
        }
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    /// Canonical `worker_id` for this instance.
    pub fn worker_id(&self) -> String {
        worker_id_for(&self.worker.id())
    }

    /// Run `pre_work` unless it already succeeded for this instance.
    ///
    /// A failed or panicking setup is retried on the next call.
    pub async fn prepare(&self, ctx: &WorkContext) -> Result<(), WorkerError> {
        self.prepared
            .get_or_try_init(|| async {
                AssertUnwindSafe(self.worker.pre_work(ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(WorkerError::Panicked(panic_message(panic.as_ref()))))
            })
            .await
            .map(|_| ())
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Registry of worker modules and cache of constructed workers.
pub struct PluginCache {
    modules: RwLock<HashMap<String, Arc<dyn WorkerModule>>>,
    /// Held across construction so one identity is never built twice.
    instances: Mutex<HashMap<PluginKey, Arc<LoadedWorker>>>,
}

impl PluginCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Register a module. Re-registering a name replaces its constructor and
    /// drops instances built by the old one.
    pub async fn register(&self, module_name: impl Into<String>, module: impl WorkerModule + 'static) {
        let name = module_name.into();
        let replaced = self
            .modules
            .write()
            .await
            .insert(name.clone(), Arc::new(module))
            .is_some();
        if replaced {
            self.instances.lock().await.retain(|key, _| key.module != name);
            tracing::warn!(module = %name, "Worker module re-registered, cached instances dropped");
        } else {
            tracing::debug!(module = %name, "Registered worker module");
        }
    }

    /// Registered module names, sorted.
    pub async fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn has_module(&self, module_name: &str) -> bool {
        self.modules.read().await.contains_key(module_name)
    }

    /// Resolve a worker, constructing it on first use.
    pub async fn load(
        &self,
        module: &str,
        class_name: &str,
        args: &[serde_json::Value],
    ) -> Result<Arc<LoadedWorker>, PluginError> {
        let constructor = self
            .modules
            .read()
            .await
            .get(module)
            .cloned()
            .ok_or_else(|| PluginError::NotFound {
                module: module.to_string(),
            })?;

        let key = PluginKey::new(module, class_name, args);
        let mut instances = self.instances.lock().await;
        if let Some(loaded) = instances.get(&key) {
            return Ok(Arc::clone(loaded));
        }

        let worker = std::panic::catch_unwind(AssertUnwindSafe(|| {
            constructor.construct(class_name, args)
        }))
        .unwrap_or_else(|panic| {
            Err(anyhow::anyhow!(
                "constructor panicked: {}",
                panic_message(panic.as_ref())
            ))
        })
        .map_err(|source| PluginError::ConstructionFailed {
            module: module.to_string(),
            class_name: class_name.to_string(),
            source,
        })?;
        let loaded = Arc::new(LoadedWorker::new(worker));
        instances.insert(key, Arc::clone(&loaded));
        tracing::debug!(module, class_name, worker_id = %loaded.worker_id(), "Constructed worker");
        Ok(loaded)
    }

    /// Number of memoized instances.
    pub async fn cached_count(&self) -> usize {
        self.instances.lock().await.len()
    }
}

impl Default for PluginCache {
    fn default() -> Self {
        Self::new()
    }
}
