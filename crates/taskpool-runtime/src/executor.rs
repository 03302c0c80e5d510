use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use taskpool_core::{ExecutionError, Job, Task};
use tokio::time::timeout;
use tracing::debug;

/// Runs one attempt of a job under the task's deadline.
///
/// Errors, panics and timeouts all come back as `ExecutionError`; nothing
/// escapes to the calling worker.
pub struct TaskExecutor {
    job: Arc<dyn Job>,
}

impl TaskExecutor {
    pub fn new(job: Arc<dyn Job>) -> Self {
        TaskExecutor { job }
    }

    pub async fn execute(&self, task: &Task) -> Result<Value, ExecutionError> {
        debug!("Executing task {} with timeout {:?}", task.id, task.timeout);

        // Dropping the future on timeout cancels the job at its next await.
        let attempt = AssertUnwindSafe(self.job.run()).catch_unwind();
        match timeout(task.timeout, attempt).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(ExecutionError::Task(message)),
            Ok(Err(panic)) => Err(ExecutionError::Panicked(panic_message(panic))),
            Err(_) => Err(ExecutionError::Timeout(task.timeout)),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
