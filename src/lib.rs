//! Broccoli: worker orchestration core.

pub mod admin;
pub mod builtin;
pub mod config;
pub mod content;
pub mod error;
pub mod executor;
pub mod reconciler;
pub mod store;
pub mod worker;
