use std::time::Duration;
use thiserror::Error;

/// Errors returned synchronously to queue callers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Queue is full (max_size = {max_size})")]
    QueueFull { max_size: usize },

    #[error("Task timeout must be greater than zero")]
    InvalidTimeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Failures that happen while a task is running.
///
/// These are never propagated out of a worker. The scheduler renders them
/// into the task's `error` field and moves on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Timeout after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("{0}")]
    Task(String),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("No function provided")]
    MissingJob,
}

impl ExecutionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout(_))
    }
}
