//! Worker modules shipped with the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::WorkerError;
use crate::worker::{PluginCache, WorkContext, Worker};

pub const HEARTBEAT_MODULE: &str = "heartbeat";

/// Records a tick counter and timestamp in its metadata. Useful as a smoke
/// test for a fresh deployment.
pub struct HeartbeatWorker {
    name: String,
}

impl HeartbeatWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Worker for HeartbeatWorker {
    fn id(&self) -> String {
        format!("heartbeat.{}", self.name)
    }

    async fn pre_work(&self, ctx: &WorkContext) -> Result<(), WorkerError> {
        if ctx.metadata().get("ticks").await?.is_none() {
            ctx.metadata().set("ticks", serde_json::json!(0)).await?;
        }
        Ok(())
    }

    async fn work(&self, ctx: &WorkContext) -> Result<(), WorkerError> {
        let ticks = ctx
            .metadata()
            .get("ticks")
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            + 1;
        ctx.metadata().set("ticks", serde_json::json!(ticks)).await?;
        ctx.metadata()
            .set("last_beat", serde_json::json!(Utc::now().to_rfc3339()))
            .await?;
        tracing::debug!(ticks, "Heartbeat");
        Ok(())
    }
}

/// Construct heartbeat workers. Class `Heartbeat`, optional first arg is the name.
fn construct_heartbeat(
    class_name: &str,
    args: &[serde_json::Value],
) -> anyhow::Result<Arc<dyn Worker>> {
    if class_name != "Heartbeat" {
        anyhow::bail!("unknown heartbeat class {class_name}");
    }
    let name = match args.first() {
        None => "default",
        Some(value) => value
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("heartbeat name must be a string"))?,
    };
    Ok(Arc::new(HeartbeatWorker::new(name)))
}

/// Register every built-in module.
pub async fn register_builtins(plugins: &PluginCache) {
    plugins.register(HEARTBEAT_MODULE, construct_heartbeat).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::worker::WorkContextFactory;

    #[tokio::test]
    async fn heartbeat_counts_ticks() {
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let contexts = WorkContextFactory::new(backend.clone(), backend);
        let plugins = PluginCache::new();
        register_builtins(&plugins).await;

        let loaded = plugins
            .load(HEARTBEAT_MODULE, "Heartbeat", &[serde_json::json!("main")])
            .await
            .unwrap();
        assert_eq!(loaded.worker_id(), "broccoli.worker.heartbeat.main");

        let ctx = contexts.build(&loaded.worker_id());
        loaded.prepare(&ctx).await.unwrap();
        loaded.worker().work(&ctx).await.unwrap();
        loaded.worker().work(&ctx).await.unwrap();

        let meta = ctx.metadata().get_all().await.unwrap();
        assert_eq!(meta["ticks"], serde_json::json!(2));
        assert!(meta["last_beat"].as_str().is_some());
    }

    #[tokio::test]
    async fn rejects_bad_construction() {
        let plugins = PluginCache::new();
        register_builtins(&plugins).await;
        assert!(plugins.load(HEARTBEAT_MODULE, "Other", &[]).await.is_err());
        assert!(
            plugins
                .load(HEARTBEAT_MODULE, "Heartbeat", &[serde_json::json!(5)])
                .await
                .is_err()
        );
    }
}
