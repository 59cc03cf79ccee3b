//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Process-wide orchestrator configuration, captured once at startup.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Global emergency stop: ticks return without running workers.
    pub pause_workers: bool,
    /// Slot count of the capacity-bounded executor. `None` disables it.
    pub reduced_max_jobs: Option<usize>,
    /// How many workers one bounded slot may multiplex.
    pub reduced_workers_per_slot: usize,
    /// Reconciler poll period.
    pub reconcile_interval: Duration,
    /// Webhook receiving reported worker failures. `None` reports to the log.
    pub error_webhook_url: Option<SecretString>,
    /// Display name of this deployment.
    pub instance_title: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/broccoli.db"),
            pause_workers: false,
            reduced_max_jobs: None,
            reduced_workers_per_slot: 16,
            reconcile_interval: Duration::from_secs(5),
            error_webhook_url: None,
            instance_title: "Untitled".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Build configuration from `BROCCOLI_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let db_path = lookup("BROCCOLI_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let pause_workers = lookup("BROCCOLI_PAUSE_WORKERS")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let reduced_max_jobs: Option<usize> = parse_opt(&lookup, "BROCCOLI_REDUCED_MAX_JOBS")?;
        if reduced_max_jobs == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "BROCCOLI_REDUCED_MAX_JOBS".into(),
                message: "must be at least 1".into(),
            });
        }

        let reduced_workers_per_slot = parse_opt(&lookup, "BROCCOLI_REDUCED_WORKERS_PER_SLOT")?
            .unwrap_or(defaults.reduced_workers_per_slot)
            .max(1);

        let reconcile_interval = parse_opt::<u64, _>(&lookup, "BROCCOLI_RECONCILE_INTERVAL_SECS")?
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(defaults.reconcile_interval);

        let error_webhook_url = lookup("BROCCOLI_ERROR_WEBHOOK_URL")
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from);

        let instance_title = lookup("BROCCOLI_INSTANCE_TITLE").unwrap_or(defaults.instance_title);

        Ok(Self {
            db_path,
            pause_workers,
            reduced_max_jobs,
            reduced_workers_per_slot,
            reconcile_interval,
            error_webhook_url,
            instance_title,
        })
    }
}

fn parse_opt<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}
