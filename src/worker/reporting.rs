//! Error reporting sinks for worker failures that crossed their resiliency threshold.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};

use crate::config::OrchestratorConfig;
use crate::error::WorkerError;

/// Destination for reportable worker failures. Reporting is best-effort.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn report(&self, error: &WorkerError, worker_id: &str);
}

/// Reports through the log at error level.
pub struct LogSink;

#[async_trait]
impl ErrorSink for LogSink {
    async fn report(&self, error: &WorkerError, worker_id: &str) {
        tracing::error!(worker_id, error = %error, "Worker failed");
    }
}

/// Upper bound on one webhook delivery, so a stalled endpoint cannot hold a tick.
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts a JSON payload to an incoming webhook, falling back to the log.
pub struct WebhookSink {
    url: SecretString,
    instance_title: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: SecretString, instance_title: impl Into<String>) -> Self {
        Self {
            url,
            instance_title: instance_title.into(),
            client: reqwest::Client::new(),
            timeout: DEFAULT_WEBHOOK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn payload(&self, error: &WorkerError, worker_id: &str) -> serde_json::Value {
        serde_json::json!({
            "instance": self.instance_title,
            "worker_id": worker_id,
            "error": error.to_string(),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

#[async_trait]
impl ErrorSink for WebhookSink {
    async fn report(&self, error: &WorkerError, worker_id: &str) {
        tracing::error!(worker_id, error = %error, "Worker failed");

        let send = self
            .client
            .post(self.url.expose_secret())
            .json(&self.payload(error, worker_id))
            .send();
        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(resp)) if resp.status().is_success() => {}
            Ok(Ok(resp)) => {
                tracing::warn!(worker_id, status = ?resp.status(), "Error webhook rejected report");
            }
            Ok(Err(e)) => {
                tracing::warn!(worker_id, "Error webhook unreachable: {e}");
            }
            Err(_) => {
                tracing::warn!(worker_id, timeout = ?self.timeout, "Error webhook timed out");
            }
        }
    }
}

/// Pick the sink for this process: webhook when configured, log otherwise.
pub fn sink_from_config(config: &OrchestratorConfig) -> Arc<dyn ErrorSink> {
    match &config.error_webhook_url {
        Some(url) => Arc::new(WebhookSink::new(url.clone(), config.instance_title.clone())),
        None => Arc::new(LogSink),
    }
}
