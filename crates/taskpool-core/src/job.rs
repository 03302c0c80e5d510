use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

/// Result type for jobs. The error string is recorded verbatim on the task.
pub type JobResult = std::result::Result<Value, String>;

/// A re-runnable unit of work.
///
/// Retries call `run` again on the same instance, so implementations must not
/// assume they execute only once.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> JobResult;
}

/// Adaptor turning a closure that returns a future into a `Job`.
pub struct FnJob<F> {
    f: F,
}

/// Wrap an async closure as a job.
///
/// ```
/// use taskpool_core::{job_fn, Job};
/// use serde_json::json;
///
/// let job = job_fn(|| async { Ok(json!({"rows": 3})) });
/// # let _ = &job as &dyn Job;
/// ```
pub fn job_fn<F, Fut>(f: F) -> FnJob<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    FnJob { f }
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    async fn run(&self) -> JobResult {
        (self.f)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Echo(Value);

    #[async_trait]
    impl Job for Echo {
        async fn run(&self) -> JobResult {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_trait_object() {
        let job: Arc<dyn Job> = Arc::new(Echo(json!("hello")));
        assert_eq!(job.run().await, Ok(json!("hello")));
    }

    #[tokio::test]
    async fn test_job_fn_reruns() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let job = job_fn(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 2 {
                    Err(format!("attempt {} failed", n))
                } else {
                    Ok(json!(n))
                }
            }
        });

        assert_eq!(job.run().await, Err("attempt 1 failed".to_string()));
        assert_eq!(job.run().await, Ok(json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
