use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use taskpool_core::{
    Job, Priority, QueueError, Result, Task, TaskId, TaskQueueConfig, TaskRequest, TaskStatus,
};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Heap entry: ordering key plus the id of the task it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    priority: Priority,
    seq: u64,
    id: TaskId,
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry, so the lowest priority value
        // and the earliest submission must compare greatest.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TaskSlot {
    task: Task,
    job: Option<Arc<dyn Job>>,
    seq: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

struct QueueState {
    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<TaskId, TaskSlot>,
    next_seq: u64,
    counters: Counters,
}

impl QueueState {
    fn push(&mut self, priority: Priority, seq: u64, id: TaskId) {
        self.heap.push(HeapEntry { priority, seq, id });
    }
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Entries currently in the heap
    pub size: usize,
    pub max_size: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Registry tasks in PENDING
    pub pending: usize,
    /// Registry tasks in RUNNING (or the transient TIMEOUT)
    pub running: usize,
}

/// A task that has just moved to RUNNING, with the job to execute.
pub struct RunningTask {
    pub task: Task,
    pub job: Option<Arc<dyn Job>>,
}

/// In-memory priority queue and task registry.
///
/// The registry owns every task record; the heap only holds ids ordered by
/// priority and submission sequence. One mutex guards both, and it is never
/// held across an await point.
pub struct TaskQueue {
    config: TaskQueueConfig,
    retry_delay: Duration,
    state: Mutex<QueueState>,
    not_empty: Notify,
}

impl TaskQueue {
    /// Create a queue, rejecting a config that fails validation.
    pub fn new(config: TaskQueueConfig) -> Result<Self> {
        config.validate()?;
        let retry_delay = config.retry_delay()?;
        Ok(Self::with_validated(config, retry_delay))
    }

    fn with_validated(config: TaskQueueConfig, retry_delay: Duration) -> Self {
        TaskQueue {
            config,
            retry_delay,
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                tasks: HashMap::new(),
                next_seq: 0,
                counters: Counters::default(),
            }),
            not_empty: Notify::new(),
        }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    /// Pause between a failed attempt and its retry
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Submit a task. Fails with `QueueFull` when the heap is at capacity,
    /// in which case nothing is recorded.
    pub fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        let (task, job) = request.build(&self.config)?;
        let task_id = task.id;
        let priority = task.priority;

        {
            let mut state = self.state.lock();
            if state.heap.len() >= self.config.max_size {
                warn!(
                    max_size = self.config.max_size,
                    "Queue full, rejecting task {}", task.name
                );
                return Err(QueueError::QueueFull {
                    max_size: self.config.max_size,
                });
            }

            let seq = state.next_seq;
            state.next_seq += 1;

            debug!("Submitted task {} ({}, priority {})", task_id, task.name, priority);
            state.tasks.insert(task_id, TaskSlot { task, job, seq });
            state.push(priority, seq, task_id);
            state.counters.submitted += 1;
        }

        self.not_empty.notify_waiters();
        Ok(task_id)
    }

    /// Pop the most urgent pending task, waiting up to `wait` for one to
    /// arrive (forever if `None`). Returns `None` on timeout.
    pub async fn get(&self, wait: Option<Duration>) -> Option<Task> {
        let deadline = wait.map(|wait| Instant::now() + wait);

        loop {
            // Register interest before checking so a submit between the
            // check and the await is not missed.
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_get() {
                return Some(task);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Non-blocking variant of `get`.
    pub fn try_get(&self) -> Option<Task> {
        let mut state = self.state.lock();

        while let Some(entry) = state.heap.pop() {
            let Some(slot) = state.tasks.get_mut(&entry.id) else {
                continue;
            };
            if slot.task.schedule() {
                debug!("Dispatching task {} ({})", entry.id, slot.task.name);
                return Some(slot.task.clone());
            }
        }
        None
    }

    pub fn get_status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.state.lock().tasks.get(task_id).map(|slot| slot.task.status)
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<Task> {
        self.state.lock().tasks.get(task_id).map(|slot| slot.task.clone())
    }

    /// Cancel a PENDING or SCHEDULED task. Running and finished tasks are
    /// left untouched.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let mut state = self.state.lock();

        let Some(slot) = state.tasks.get_mut(task_id) else {
            return false;
        };
        if !slot.task.cancel() {
            debug!("Task {} is {}, not cancelling", task_id, slot.task.status);
            return false;
        }

        state.heap.retain(|entry| entry.id != *task_id);
        state.counters.cancelled += 1;
        info!("Cancelled task {}", task_id);
        true
    }

    /// Move a SCHEDULED task to RUNNING and hand back its job.
    ///
    /// Returns `None` if the task is unknown or no longer SCHEDULED, which
    /// happens when it was cancelled after being dispatched.
    pub fn mark_running(&self, task_id: &TaskId) -> Option<RunningTask> {
        let mut state = self.state.lock();
        let slot = state.tasks.get_mut(task_id)?;

        if !slot.task.start() {
            return None;
        }
        Some(RunningTask {
            task: slot.task.clone(),
            job: slot.job.clone(),
        })
    }

    /// Flag a RUNNING task as having exceeded its deadline.
    pub fn mark_timed_out(&self, task_id: &TaskId) -> bool {
        let mut state = self.state.lock();
        state
            .tasks
            .get_mut(task_id)
            .map(|slot| slot.task.time_out())
            .unwrap_or(false)
    }

    /// Record the outcome of a running task. Any error makes it FAILED.
    pub fn complete(
        &self,
        task_id: &TaskId,
        result: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let mut state = self.state.lock();

        let Some(slot) = state.tasks.get_mut(task_id) else {
            return false;
        };

        match error {
            Some(error) => {
                if !slot.task.fail(error) {
                    return false;
                }
                state.counters.failed += 1;
            }
            None => {
                if !slot.task.complete(result) {
                    return false;
                }
                state.counters.completed += 1;
            }
        }
        true
    }

    /// Re-queue a FAILED task if it has retry budget left and the heap has
    /// room for it.
    ///
    /// A retry refused for lack of room makes the failure final by dropping
    /// the remaining budget.
    pub fn retry(&self, task_id: &TaskId) -> bool {
        {
            let mut state = self.state.lock();
            let heap_full = state.heap.len() >= self.config.max_size;

            let Some(slot) = state.tasks.get_mut(task_id) else {
                return false;
            };
            if slot.task.status != TaskStatus::Failed || !slot.task.can_retry() {
                return false;
            }

            if heap_full {
                warn!(
                    "Queue full, giving up on task {} after {} retries",
                    task_id, slot.task.retry_count
                );
                slot.task.max_retries = slot.task.retry_count;
                return false;
            }

            if !slot.task.retry() {
                return false;
            }

            let (priority, seq) = (slot.task.priority, slot.seq);
            info!(
                "Retrying task {} (attempt {}/{})",
                task_id, slot.task.retry_count, slot.task.max_retries
            );
            state.push(priority, seq, *task_id);
        }

        self.not_empty.notify_waiters();
        true
    }

    /// Drop a terminal task from the registry.
    pub fn forget(&self, task_id: &TaskId) -> Option<Task> {
        let mut state = self.state.lock();
        if !state.tasks.get(task_id)?.task.is_terminal() {
            return None;
        }
        state.tasks.remove(task_id).map(|slot| slot.task)
    }

    /// Snapshot of registry tasks in submission order.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let state = self.state.lock();
        let mut slots: Vec<&TaskSlot> = state
            .tasks
            .values()
            .filter(|slot| status.map_or(true, |status| slot.task.status == status))
            .collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.task.clone()).collect()
    }

    /// Number of tasks waiting in the heap
    pub fn size(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    /// Heap depth per priority tier, most urgent first
    pub fn depth_by_priority(&self) -> Vec<(Priority, usize)> {
        let state = self.state.lock();
        Priority::ALL
            .iter()
            .map(|tier| {
                let count = state.heap.iter().filter(|entry| entry.priority == *tier).count();
                (*tier, count)
            })
            .collect()
    }

    pub fn get_stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut pending = 0;
        let mut running = 0;

        for slot in state.tasks.values() {
            match slot.task.status {
                TaskStatus::Pending => pending += 1,
                status if status.is_running() => running += 1,
                _ => {}
            }
        }

        QueueStats {
            size: state.heap.len(),
            max_size: self.config.max_size,
            submitted: state.counters.submitted,
            completed: state.counters.completed,
            failed: state.counters.failed,
            cancelled: state.counters.cancelled,
            pending,
            running,
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        let config = TaskQueueConfig::default();
        let retry_delay = config.retry_delay().unwrap_or_default();
        Self::with_validated(config, retry_delay)
    }
}
