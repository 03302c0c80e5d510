pub mod queue;
pub mod scheduler;
pub mod executor;
pub mod metrics;

pub use queue::{QueueStats, RunningTask, TaskQueue};
pub use scheduler::TaskScheduler;
pub use executor::TaskExecutor;
pub use metrics::SchedulerMetrics;

pub use taskpool_core::{
    job_fn, ExecutionError, Job, JobResult, Priority, QueueError, Task, TaskId, TaskQueueConfig,
    TaskRequest, TaskStatus,
};
