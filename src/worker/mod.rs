//! Worker system: plugins, stored definitions, execution contexts and tick wrapping.
//!
//! Core components:
//! - `plugin`: `Worker` contract and the memoizing `PluginCache`
//! - `definition`: desired worker configuration and runtime counters
//! - `config_store`: durable CRUD over worker definitions
//! - `context`: per-worker `WorkContext` and its factory
//! - `wrapper`: builds tick functions with pause and resiliency handling
//! - `reporting`: sinks for reportable failures

pub mod config_store;
pub mod context;
pub mod definition;
pub mod plugin;
pub mod reporting;
pub mod wrapper;

pub use config_store::WorkerConfigStore;
pub use context::{WorkContext, WorkContextFactory, WorkerMetadata};
pub use definition::{WorkerDefinition, WorkerRecord, WorkerRuntimeState, worker_id_for};
pub use plugin::{LoadedWorker, PluginCache, Worker, WorkerModule};
pub use reporting::{ErrorSink, LogSink, WebhookSink};
pub use wrapper::{TickFn, TickOutcome, WorkFactory, WrappedWork};
