use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument, Span};

use crate::aggregate::{validate_schema, AggregateSummary, Aggregator};
use crate::error::PipelineError;
use crate::models::WorkItem;
use crate::retry::RetryPolicy;
use crate::service::JobService;

/// Everything a worker needs, shared by the whole pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub service: Arc<JobService>,
    pub aggregator: Arc<dyn Aggregator>,
    pub retry: RetryPolicy,
    pub required_columns: Arc<[String]>,
}

/// Fixed set of long-lived workers draining the service's queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers. Each runs inside its own `worker` span under
    /// `parent`.
    pub fn spawn(count: usize, context: WorkerContext, parent: &Span) -> Self {
        let handles = (0..count)
            .map(|n| {
                let span = info_span!(parent: parent, "worker", worker = n);
                tokio::spawn(run_worker(n, context.clone()).instrument(span))
            })
            .collect();

        Self { handles }
    }

    /// Waits for every worker to exit. Workers only exit once the queue has
    /// been closed and drained.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task ended abnormally");
            }
        }
    }
}

async fn run_worker(n: usize, context: WorkerContext) {
    info!(worker = n, "worker started");

    while let Some(delivery) = context.service.queue().pop().await {
        let item = delivery.item().clone();

        let outcome = AssertUnwindSafe(process_job(&context, &item))
            .catch_unwind()
            .await;

        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            error!(job_id = %item.job_id, panic = %message, "worker defect while processing job");
            context.service.registry().fail_if_live(
                &item.job_id,
                Utc::now(),
                format!("unexpected worker defect: {message}"),
            );
        }

        drop(delivery);
        debug!(job_id = %item.job_id, "marked job as done in queue");
    }

    info!(worker = n, "queue closed, worker exiting");
}

/// Runs the pipeline for one job and leaves its record in a terminal state.
async fn process_job(context: &WorkerContext, item: &WorkItem) {
    let job_id = item.job_id.as_str();
    let registry = context.service.registry();

    info!(job_id, input = %item.input.display(), "worker started job");

    let input = item.input.clone();
    let required = context.required_columns.clone();
    if let Err(err) = offload(move || validate_schema(&input, &required)).await {
        error!(job_id, error = %err, "validation failed");
        record_failure(context, job_id, &err);
        return;
    }

    if let Err(err) = registry.mark_started(job_id, Utc::now()) {
        error!(job_id, error = %err, "could not mark job as started");
        return;
    }

    let result = context
        .retry
        .run(job_id, |attempt| {
            let aggregator = context.aggregator.clone();
            let input = item.input.clone();
            let output_dir = context.service.output_dir().to_path_buf();
            async move {
                debug!(job_id, attempt, "aggregation attempt");
                offload(move || aggregator.aggregate(&input, &output_dir)).await
            }
        })
        .await;

    match result {
        Ok(AggregateSummary {
            path,
            rows,
            departments,
        }) => match registry.mark_finished(job_id, Utc::now(), path.clone()) {
            Ok(_) => info!(
                job_id,
                rows,
                departments,
                result = %path.display(),
                "worker finished job"
            ),
            Err(err) => error!(job_id, error = %err, "could not mark job as finished"),
        },
        Err(err) => {
            error!(job_id, error = %err, "worker failed job");
            record_failure(context, job_id, &err);
        }
    }
}

fn record_failure(context: &WorkerContext, job_id: &str, err: &PipelineError) {
    if let Err(store_err) =
        context
            .service
            .registry()
            .mark_failed(job_id, Utc::now(), err.to_string())
    {
        error!(job_id, error = %store_err, "could not mark job as failed");
    }
}

/// Runs blocking pipeline work on the blocking thread pool so it never
/// stalls admission or status queries.
async fn offload<T, F>(work: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(PipelineError::Aborted(panic_message(
            err.into_panic().as_ref(),
        ))),
        Err(err) => Err(PipelineError::Aborted(err.to_string())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{default_required_columns, CsvAggregator};
    use std::time::Duration;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn context(service: Arc<JobService>) -> WorkerContext {
        WorkerContext {
            service,
            aggregator: Arc::new(CsvAggregator::default()),
            retry: RetryPolicy::new(2, Duration::from_millis(5)),
            required_columns: default_required_columns().into(),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_worker_logs_job_outcomes() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad.csv");
        let good = dir.path().join("good.csv");
        std::fs::write(&bad, "Department Name,Date\nSales,2024-01-01\n").unwrap();
        std::fs::write(&good, "Department Name,Date,Number of Sales\nSales,2024-01-01,3\n")
            .unwrap();

        let service = Arc::new(JobService::new(dir.path()));
        service.submit("bad", bad).unwrap();
        service.submit("good", good).unwrap();

        let pool = WorkerPool::spawn(1, context(service.clone()), &Span::current());
        tokio::time::timeout(Duration::from_secs(10), service.queue().join())
            .await
            .expect("queue never drained");

        assert!(logs_contain("validation failed"));
        assert!(logs_contain("worker finished job"));

        service.queue().close();
        pool.join().await;
        assert!(logs_contain("queue closed, worker exiting"));
    }

    #[test]
    fn test_panic_message_extracts_text() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_offload_turns_panic_into_error() {
        let err = offload::<(), _>(|| panic!("exploded")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Aborted(ref message) if message == "exploded"));
        assert!(err.is_transient());
    }
}
