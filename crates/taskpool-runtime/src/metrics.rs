use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Prometheus metrics for the scheduler
pub struct SchedulerMetrics {
    pub registry: Registry,

    // Attempts by outcome: completed, failed, timeout, retried
    pub tasks_total: IntCounterVec,

    pub tasks_running: IntGauge,
    pub queue_depth: IntGauge,

    pub task_duration: Histogram,
}

impl SchedulerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let tasks_total = IntCounterVec::new(
            Opts::new("taskpool_tasks_total", "Task attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        let tasks_running =
            IntGauge::new("taskpool_tasks_running", "Number of tasks currently executing")?;
        registry.register(Box::new(tasks_running.clone()))?;

        let queue_depth =
            IntGauge::new("taskpool_queue_depth", "Number of tasks waiting in the queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let task_duration = Histogram::with_opts(HistogramOpts::new(
            "taskpool_task_duration_seconds",
            "Execution time of a single task attempt in seconds",
        ))?;
        registry.register(Box::new(task_duration.clone()))?;

        Ok(SchedulerMetrics {
            registry,
            tasks_total,
            tasks_running,
            queue_depth,
            task_duration,
        })
    }

    pub fn inc_tasks_total(&self, outcome: &str) {
        self.tasks_total.with_label_values(&[outcome]).inc();
    }

    pub fn tasks_with_outcome(&self, outcome: &str) -> u64 {
        self.tasks_total.with_label_values(&[outcome]).get()
    }

    pub fn observe_duration(&self, duration_secs: f64) {
        self.task_duration.observe(duration_secs);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    /// Render all metrics in the text exposition format
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
