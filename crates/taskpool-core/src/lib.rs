mod task;
mod priority;
mod error;
mod config;
mod job;

pub use task::{Task, TaskId, TaskRequest, TaskStatus, Metadata};
pub use priority::Priority;
pub use error::{QueueError, ExecutionError, Result};
pub use config::TaskQueueConfig;
pub use job::{job_fn, FnJob, Job, JobResult};
