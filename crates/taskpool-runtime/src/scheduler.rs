use crate::executor::TaskExecutor;
use crate::metrics::SchedulerMetrics;
use crate::queue::{RunningTask, TaskQueue};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskpool_core::{ExecutionError, Task};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a worker waits on an empty queue before re-checking for shutdown.
const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct Shared {
    queue: Arc<TaskQueue>,
    retry_delay: Duration,
    running: AtomicBool,
    permits: Arc<Semaphore>,
    metrics: Option<Arc<SchedulerMetrics>>,
}

/// Bounded pool of workers draining a `TaskQueue`.
///
/// Must be started from within a tokio runtime.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    max_workers: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self::build(queue, None)
    }

    pub fn with_metrics(queue: Arc<TaskQueue>, metrics: Arc<SchedulerMetrics>) -> Self {
        Self::build(queue, Some(metrics))
    }

    fn build(queue: Arc<TaskQueue>, metrics: Option<Arc<SchedulerMetrics>>) -> Self {
        let max_workers = queue.config().max_workers.max(1);
        let retry_delay = queue.retry_delay();

        TaskScheduler {
            shared: Arc::new(Shared {
                queue,
                retry_delay,
                running: AtomicBool::new(false),
                permits: Arc::new(Semaphore::new(max_workers)),
                metrics,
            }),
            max_workers,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Launch the worker loops. Calling this on a running scheduler is a no-op.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("Scheduler already running");
            return;
        }

        info!("Starting scheduler with {} workers", self.max_workers);

        let mut workers = self.workers.lock();
        for worker_id in 0..self.max_workers {
            let shared = self.shared.clone();
            workers.push(tokio::spawn(worker_loop(shared, worker_id)));
        }
    }

    /// Stop the workers.
    ///
    /// With `wait`, each worker finishes its current task (including any
    /// pending retry delay) before exiting. Without it, workers are aborted on
    /// the spot: a task that was executing stays RUNNING and no outcome is
    /// ever recorded for it. The `tasks_running` gauge also keeps counting
    /// such a task.
    pub async fn stop(&self, wait: bool) {
        self.shared.running.store(false, Ordering::SeqCst);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();

        if workers.is_empty() {
            return;
        }

        if wait {
            info!("Waiting for {} workers to finish", workers.len());
        } else {
            warn!("Aborting {} workers; in-flight tasks will not be recorded", workers.len());
            for worker in &workers {
                worker.abort();
            }
        }

        for worker in workers {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    warn!("Worker exited abnormally: {}", e);
                }
            }
        }

        info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Number of worker loops that have not exited yet
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|worker| !worker.is_finished())
            .count()
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.shared.queue
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    debug!(worker_id, "Worker started");

    while shared.running.load(Ordering::SeqCst) {
        let Ok(_permit) = shared.permits.clone().acquire_owned().await else {
            break;
        };

        let Some(task) = shared.queue.get(Some(WORKER_POLL_INTERVAL)).await else {
            continue;
        };

        if let Some(metrics) = &shared.metrics {
            metrics.set_queue_depth(shared.queue.size());
        }

        shared.execute(task, worker_id).await;
    }

    debug!(worker_id, "Worker stopped");
}

impl Shared {
    async fn execute(&self, task: Task, worker_id: usize) {
        let Some(RunningTask { task, job }) = self.queue.mark_running(&task.id) else {
            debug!(worker_id, "Task {} is no longer scheduled, skipping", task.id);
            return;
        };

        let Some(job) = job else {
            let error = ExecutionError::MissingJob;
            warn!(worker_id, "Task {} ({}) failed: {}", task.id, task.name, error);
            self.queue.complete(&task.id, None, Some(error.to_string()));
            self.record("failed");
            return;
        };

        info!(worker_id, "Running task {} ({})", task.id, task.name);

        if let Some(metrics) = &self.metrics {
            metrics.tasks_running.inc();
        }
        let started = Instant::now();

        let outcome = TaskExecutor::new(job).execute(&task).await;

        if let Some(metrics) = &self.metrics {
            metrics.tasks_running.dec();
            metrics.observe_duration(started.elapsed().as_secs_f64());
        }

        match outcome {
            Ok(value) => {
                self.queue.complete(&task.id, Some(value), None);
                self.record("completed");
                info!(worker_id, "Task {} completed in {:?}", task.id, started.elapsed());
            }
            Err(error) => {
                if error.is_timeout() {
                    self.queue.mark_timed_out(&task.id);
                    self.record("timeout");
                } else {
                    self.record("failed");
                }

                warn!(worker_id, "Task {} ({}) failed: {}", task.id, task.name, error);
                self.queue.complete(&task.id, None, Some(error.to_string()));

                if task.can_retry() {
                    tokio::time::sleep(self.retry_delay).await;
                    if self.queue.retry(&task.id) {
                        self.record("retried");
                    }
                } else {
                    warn!("Task {} exhausted {} retries", task.id, task.max_retries);
                }
            }
        }
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_tasks_total(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use taskpool_core::{job_fn, TaskId, TaskQueueConfig, TaskRequest, TaskStatus};

    fn scheduler(max_workers: usize) -> TaskScheduler {
        let queue = Arc::new(
            TaskQueue::new(TaskQueueConfig {
                max_workers,
                retry_delay_secs: 0.05,
                ..Default::default()
            })
            .unwrap(),
        );
        TaskScheduler::new(queue)
    }

    async fn wait_until(
        queue: &TaskQueue,
        task_id: &TaskId,
        done: impl Fn(&Task) -> bool,
    ) -> Task {
        for _ in 0..500 {
            if let Some(task) = queue.get_task(task_id) {
                if done(&task) {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached the expected state", task_id);
    }

    async fn wait_for(queue: &TaskQueue, task_id: &TaskId, status: TaskStatus) -> Task {
        wait_until(queue, task_id, |task| task.status == status).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let scheduler = scheduler(3);
        scheduler.start();
        scheduler.start();

        assert!(scheduler.is_running());
        assert_eq!(scheduler.worker_count(), 3);

        scheduler.stop(true).await;
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.worker_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_task_to_completion() {
        let scheduler = scheduler(2);
        let queue = scheduler.queue().clone();
        scheduler.start();

        let task_id = queue
            .submit(TaskRequest::new("answer").job(job_fn(|| async { Ok(json!(42)) })))
            .unwrap();

        let task = wait_for(&queue, &task_id, TaskStatus::Completed).await;
        assert_eq!(task.result, Some(json!(42)));
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());

        scheduler.stop(true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_job_fails_without_retrying() {
        let queue = Arc::new(
            TaskQueue::new(TaskQueueConfig {
                max_workers: 1,
                ..Default::default()
            })
            .unwrap(),
        );
        let metrics = Arc::new(SchedulerMetrics::new().unwrap());
        let scheduler = TaskScheduler::with_metrics(queue.clone(), metrics.clone());
        scheduler.start();

        // Default retry budget of 3 and a 1s retry delay
        let task_id = queue.submit(TaskRequest::new("empty")).unwrap();

        let task = wait_for(&queue, &task_id, TaskStatus::Failed).await;
        assert_eq!(task.error.as_deref(), Some("No function provided"));

        tokio::time::sleep(Duration::from_secs(10)).await;

        let task = queue.get_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert_eq!(queue.get_stats().failed, 1);
        assert_eq!(metrics.tasks_with_outcome("failed"), 1);
        assert_eq!(metrics.tasks_with_outcome("retried"), 0);
        assert_eq!(metrics.tasks_running.get(), 0);

        scheduler.stop(true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_does_not_kill_worker() {
        let scheduler = scheduler(1);
        let queue = scheduler.queue().clone();
        scheduler.start();

        let bad = queue
            .submit(
                TaskRequest::new("bad")
                    .max_retries(0)
                    .job(job_fn(|| async {
                        if true {
                            panic!("kaboom");
                        }
                        Ok(Value::Null)
                    })),
            )
            .unwrap();
        let good = queue
            .submit(TaskRequest::new("good").job(job_fn(|| async { Ok(json!("fine")) })))
            .unwrap();

        let failed = wait_for(&queue, &bad, TaskStatus::Failed).await;
        assert_eq!(failed.error.as_deref(), Some("Task panicked: kaboom"));
        wait_for(&queue, &good, TaskStatus::Completed).await;
        assert_eq!(scheduler.worker_count(), 1);

        scheduler.stop(true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_recorded() {
        let queue = Arc::new(
            TaskQueue::new(TaskQueueConfig {
                max_workers: 1,
                retry_delay_secs: 0.0,
                ..Default::default()
            })
            .unwrap(),
        );
        let metrics = Arc::new(SchedulerMetrics::new().unwrap());
        let scheduler = TaskScheduler::with_metrics(queue.clone(), metrics.clone());
        scheduler.start();

        let ok = queue
            .submit(TaskRequest::new("ok").job(job_fn(|| async { Ok(Value::Null) })))
            .unwrap();
        let flaky = queue
            .submit(
                TaskRequest::new("flaky")
                    .max_retries(1)
                    .job(job_fn(|| async { Err("nope".to_string()) })),
            )
            .unwrap();

        wait_for(&queue, &ok, TaskStatus::Completed).await;
        wait_until(&queue, &flaky, |task| {
            task.status == TaskStatus::Failed && task.retry_count == 1
        })
        .await;

        scheduler.stop(true).await;

        assert_eq!(metrics.tasks_with_outcome("completed"), 1);
        assert_eq!(metrics.tasks_with_outcome("failed"), 2);
        assert_eq!(metrics.tasks_with_outcome("retried"), 1);
        assert_eq!(metrics.tasks_running.get(), 0);
    }
}
