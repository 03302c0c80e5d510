use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskpool_core::{job_fn, Priority, QueueError, TaskId, TaskQueueConfig, TaskRequest, TaskStatus};
use taskpool_runtime::{QueueStats, SchedulerMetrics, TaskQueue, TaskScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "taskpool")]
#[command(about = "Priority task queue and worker pool", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a synthetic workload through the scheduler
    Run {
        /// Number of workers (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Number of tasks to submit
        #[arg(short, long, default_value = "50")]
        tasks: usize,

        /// Make every K-th task fail (0 = never)
        #[arg(long, default_value = "0")]
        fail_every: usize,

        /// Simulated work per task in milliseconds
        #[arg(long, default_value = "50")]
        work_ms: u64,

        /// Print Prometheus metrics when done
        #[arg(long)]
        metrics: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = match &args.config {
        Some(path) => TaskQueueConfig::from_file(path)?,
        None => TaskQueueConfig::default(),
    };

    match args.command {
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }

        Commands::Run { workers, tasks, fail_every, work_ms, metrics } => {
            if let Some(workers) = workers {
                config.max_workers = workers;
            }

            let stats = run_workload(config, tasks, fail_every, work_ms, metrics).await?;

            match args.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&stats)?),
                _ => print_stats(&stats),
            }
        }
    }

    Ok(())
}

async fn run_workload(
    config: TaskQueueConfig,
    tasks: usize,
    fail_every: usize,
    work_ms: u64,
    print_metrics: bool,
) -> anyhow::Result<QueueStats> {
    let queue = Arc::new(TaskQueue::new(config)?);
    let metrics = Arc::new(SchedulerMetrics::new()?);
    let scheduler = TaskScheduler::with_metrics(queue.clone(), metrics.clone());
    scheduler.start();

    let mut ids: Vec<TaskId> = Vec::with_capacity(tasks);
    for i in 0..tasks {
        let priority = Priority::ALL[i % Priority::ALL.len()];
        let fails = fail_every > 0 && (i + 1) % fail_every == 0;
        let work = Duration::from_millis(work_ms);

        // Back off while the queue is full instead of dropping work
        loop {
            let request = TaskRequest::new(format!("synthetic-{}", i))
                .priority(priority)
                .max_retries(if fails { 1 } else { 0 })
                .metadata("index", i)
                .job(job_fn(move || async move {
                    tokio::time::sleep(work).await;
                    if fails {
                        Err(format!("synthetic failure in task {}", i))
                    } else {
                        Ok(json!({ "index": i }))
                    }
                }));

            match queue.submit(request) {
                Ok(id) => {
                    ids.push(id);
                    break;
                }
                Err(QueueError::QueueFull { .. }) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    tracing::info!("Submitted {} tasks", ids.len());

    tokio::select! {
        _ = wait_for_all(&queue, &ids) => {
            scheduler.stop(true).await;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Received shutdown signal");
            scheduler.stop(false).await;
        }
    }

    if print_metrics {
        print!("{}", metrics.encode()?);
    }

    Ok(queue.get_stats())
}

async fn wait_for_all(queue: &TaskQueue, ids: &[TaskId]) {
    loop {
        let done = ids
            .iter()
            .filter(|id| queue.get_task(id).map_or(true, |task| task.is_terminal()))
            .count();
        if done == ids.len() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn print_stats(stats: &QueueStats) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Queue Size".to_string(), stats.size.to_string()]);
    table.add_row(vec!["Max Size".to_string(), stats.max_size.to_string()]);
    table.add_row(vec!["Submitted".to_string(), stats.submitted.to_string()]);
    table.add_row(vec![TaskStatus::Completed.to_string(), stats.completed.to_string()]);
    table.add_row(vec![TaskStatus::Failed.to_string(), stats.failed.to_string()]);
    table.add_row(vec![TaskStatus::Cancelled.to_string(), stats.cancelled.to_string()]);
    table.add_row(vec![TaskStatus::Pending.to_string(), stats.pending.to_string()]);
    table.add_row(vec![TaskStatus::Running.to_string(), stats.running.to_string()]);
    println!("{}", table);
}
