use crate::{Job, Priority, QueueError, Result, TaskQueueConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = Uuid;

/// Opaque caller-supplied key/value pairs carried on a task
pub type Metadata = HashMap<String, Value>;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the heap
    Pending,
    /// Handed to a worker by `get`, not yet running
    Scheduled,
    /// Job is executing
    Running,
    /// Job returned a value
    Completed,
    /// Job errored, panicked or timed out (may be retried)
    Failed,
    /// Cancelled before execution
    Cancelled,
    /// Deadline exceeded; transient, recorded as `Failed` once completed
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    /// Statuses from which a task may be cancelled
    pub fn is_cancellable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Scheduled)
    }

    /// Statuses in which a job is (or was just) executing
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Timeout)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "scheduled" => Ok(TaskStatus::Scheduled),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "timeout" => Ok(TaskStatus::Timeout),
            other => Err(format!("Unknown task status: {}", other)),
        }
    }
}

/// A unit of submitted work and its bookkeeping.
///
/// The job itself is not part of the record: the queue keeps it alongside
/// the task so that snapshots stay cheap to clone and serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub priority: Priority,

    /// Bound on a single execution attempt
    pub timeout: Duration,

    pub retry_count: u32,
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub metadata: Metadata,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        priority: Priority,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Task {
            id: Uuid::new_v4(),
            name: name.into(),
            priority,
            timeout,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            metadata: Metadata::new(),
        }
    }

    /// Check if the retry budget still allows another attempt
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Completed, cancelled, or failed with no retry budget left
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Cancelled => true,
            TaskStatus::Failed => !self.can_retry(),
            _ => false,
        }
    }

    /// PENDING -> SCHEDULED
    pub fn schedule(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Scheduled;
        true
    }

    /// SCHEDULED -> RUNNING
    pub fn start(&mut self) -> bool {
        if self.status != TaskStatus::Scheduled {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// RUNNING -> TIMEOUT
    pub fn time_out(&mut self) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Timeout;
        true
    }

    /// RUNNING -> COMPLETED
    pub fn complete(&mut self, result: Option<Value>) -> bool {
        if !self.status.is_running() {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.result = result;
        self.error = None;
        self.completed_at = Some(Utc::now());
        true
    }

    /// RUNNING/TIMEOUT -> FAILED
    pub fn fail(&mut self, error: String) -> bool {
        if !self.status.is_running() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        true
    }

    /// PENDING/SCHEDULED -> CANCELLED
    pub fn cancel(&mut self) -> bool {
        if !self.status.is_cancellable() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        true
    }

    /// FAILED -> PENDING, consuming one unit of retry budget
    pub fn retry(&mut self) -> bool {
        if self.status != TaskStatus::Failed || !self.can_retry() {
            return false;
        }
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.result = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        true
    }

    /// Wall-clock duration of the last attempt, if it has finished
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        (completed - started).to_std().ok()
    }
}

/// Everything a producer supplies when submitting work.
pub struct TaskRequest {
    name: String,
    job: Option<Arc<dyn Job>>,
    priority: Priority,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
    metadata: Metadata,
}

impl TaskRequest {
    pub fn new(name: impl Into<String>) -> Self {
        TaskRequest {
            name: name.into(),
            job: None,
            priority: Priority::default(),
            timeout: None,
            max_retries: None,
            metadata: Metadata::new(),
        }
    }

    pub fn job<J: Job + 'static>(mut self, job: J) -> Self {
        self.job = Some(Arc::new(job));
        self
    }

    pub fn shared_job(mut self, job: Arc<dyn Job>) -> Self {
        self.job = Some(job);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Resolve defaults from `config` and produce the task record plus its job.
    pub fn build(self, config: &TaskQueueConfig) -> Result<(Task, Option<Arc<dyn Job>>)> {
        let timeout = match self.timeout {
            Some(timeout) => timeout,
            None => config.default_timeout()?,
        };
        if timeout.is_zero() {
            return Err(QueueError::InvalidTimeout);
        }

        let max_retries = self.max_retries.unwrap_or(config.retry_limit);
        let mut task = Task::new(self.name, self.priority, timeout, max_retries);
        task.metadata = self.metadata;

        Ok((task, self.job))
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("name", &self.name)
            .field("has_job", &self.job.is_some())
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_fn;
    use serde_json::json;

    fn running_task(max_retries: u32) -> Task {
        let mut task = Task::new("test", Priority::Normal, Duration::from_secs(5), max_retries);
        assert!(task.schedule());
        assert!(task.start());
        task
    }

    #[test]
    fn test_task_creation() {
        let task = Task::new("test_task", Priority::High, Duration::from_secs(30), 3);

        assert_eq!(task.name, "test_task");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.started_at.is_none());
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = running_task(0);
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        assert!(task.complete(Some(json!(42))));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!(42)));
        assert!(task.is_terminal());
        assert!(task.duration().is_some());

        // Terminal tasks reject further transitions
        assert!(!task.complete(None));
        assert!(!task.fail("late".to_string()));
        assert!(!task.cancel());
        assert!(!task.retry());
    }

    #[test]
    fn test_timeout_collapses_to_failed() {
        let mut task = running_task(1);
        assert!(task.time_out());
        assert_eq!(task.status, TaskStatus::Timeout);

        assert!(task.fail("Timeout after 5s".to_string()));
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_retry_resets_attempt_state() {
        let mut task = running_task(1);
        assert!(task.fail("boom".to_string()));

        assert!(task.retry());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.error.is_none());
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());

        assert!(task.schedule());
        assert!(task.start());
        assert!(task.fail("boom again".to_string()));
        assert!(task.is_terminal());
        assert!(!task.retry());
        assert_eq!(task.retry_count, 1);
    }

    #[test]
    fn test_cancel_only_before_running() {
        let mut pending = Task::new("p", Priority::Low, Duration::from_secs(1), 0);
        assert!(pending.cancel());
        assert_eq!(pending.status, TaskStatus::Cancelled);
        assert!(pending.completed_at.is_some());

        let mut running = running_task(0);
        assert!(!running.cancel());
        assert_eq!(running.status, TaskStatus::Running);
    }

    #[test]
    fn test_request_uses_config_defaults() {
        let config = TaskQueueConfig::default();
        let (task, job) = TaskRequest::new("defaults").build(&config).unwrap();

        assert_eq!(task.timeout, config.default_timeout().unwrap());
        assert_eq!(task.max_retries, config.retry_limit);
        assert_eq!(task.priority, Priority::Normal);
        assert!(job.is_none());
    }

    #[test]
    fn test_request_overrides() {
        let config = TaskQueueConfig::default();
        let (task, job) = TaskRequest::new("custom")
            .job(job_fn(|| async { Ok(json!("ok")) }))
            .priority(Priority::Critical)
            .timeout(Duration::from_secs(2))
            .max_retries(5)
            .metadata("phase", "design")
            .build(&config)
            .unwrap();

        assert_eq!(task.priority, Priority::Critical);
        assert_eq!(task.timeout, Duration::from_secs(2));
        assert_eq!(task.max_retries, 5);
        assert_eq!(task.metadata.get("phase"), Some(&json!("design")));
        assert!(job.is_some());
    }

    #[test]
    fn test_request_rejects_zero_timeout() {
        let config = TaskQueueConfig::default();
        let result = TaskRequest::new("bad").timeout(Duration::ZERO).build(&config);

        match result {
            Err(QueueError::InvalidTimeout) => {}
            other => panic!("Expected InvalidTimeout, got {:?}", other.map(|(t, _)| t)),
        }
    }

    #[test]
    fn test_status_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Scheduled,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert_eq!("FAILED".parse::<TaskStatus>(), Ok(TaskStatus::Failed));
        assert!("dead_letter".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_request_with_unrepresentable_default_timeout() {
        let config = TaskQueueConfig {
            default_timeout_secs: 1e30,
            ..Default::default()
        };

        let result = TaskRequest::new("huge").build(&config);
        assert!(matches!(result, Err(QueueError::InvalidConfig(_))));

        // An explicit timeout does not consult the config default
        let (task, _) = TaskRequest::new("explicit")
            .timeout(Duration::from_secs(3))
            .build(&config)
            .unwrap();
        assert_eq!(task.timeout, Duration::from_secs(3));
    }
}
