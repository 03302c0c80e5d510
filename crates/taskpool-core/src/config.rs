use crate::{QueueError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Queue and worker-pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueConfig {
    /// Bound on pending heap entries (not on the registry)
    pub max_size: usize,
    pub max_workers: usize,
    pub default_timeout_secs: f64,
    /// Default `max_retries` for submissions that don't set one
    pub retry_limit: u32,
    /// Fixed pause between a failed attempt and its retry
    pub retry_delay_secs: f64,
    /// Placeholder: queued work is never persisted
    pub enable_persistence: bool,
    /// Placeholder: queued work is never persisted
    pub persistence_path: Option<PathBuf>,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        TaskQueueConfig {
            max_size: 10_000,
            max_workers: 10,
            default_timeout_secs: 300.0,
            retry_limit: 3,
            retry_delay_secs: 1.0,
            enable_persistence: false,
            persistence_path: None,
        }
    }
}

impl TaskQueueConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TaskQueueConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(QueueError::InvalidConfig("max_size must be at least 1".to_string()));
        }
        if self.max_workers == 0 {
            return Err(QueueError::InvalidConfig("max_workers must be at least 1".to_string()));
        }
        let timeout = self.default_timeout()?;
        if timeout.is_zero() {
            return Err(QueueError::InvalidConfig(format!(
                "default_timeout_secs must be positive (got {})",
                self.default_timeout_secs
            )));
        }
        self.retry_delay()?;
        if self.enable_persistence {
            warn!(
                path = ?self.persistence_path,
                "Persistence is not implemented; queued tasks live in memory only"
            );
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Result<Duration> {
        seconds("default_timeout_secs", self.default_timeout_secs)
    }

    pub fn retry_delay(&self) -> Result<Duration> {
        seconds("retry_delay_secs", self.retry_delay_secs)
    }
}

/// Rejects negative, NaN and out-of-range values instead of panicking on them.
fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        QueueError::InvalidConfig(format!(
            "{} must be a non-negative number of seconds within range (got {})",
            field, value
        ))
    })
}
