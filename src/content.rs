//! Content store collaborator used by workers to persist aggregated items.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// One aggregated item. `idempotency_key` de-duplicates repeated scrapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub idempotency_key: String,
    /// Worker that produced the item, if known.
    pub source: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ContentItem {
    pub fn new(idempotency_key: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            source: None,
            data,
            created_at: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Storage for aggregated content.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Append items, skipping keys already stored. Returns how many were new.
    async fn append(&self, items: &[ContentItem]) -> Result<usize, DatabaseError>;

    /// Whether an item with this key exists.
    async fn exists(&self, idempotency_key: &str) -> Result<bool, DatabaseError>;

    /// Total stored items.
    async fn count(&self) -> Result<u64, DatabaseError>;
}
