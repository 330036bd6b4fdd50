/// Job Consumer - Queue to Pipeline Bridge
///
/// **Responsibility:**
/// Pull submissions under a concurrency ceiling, run each through the
/// pipeline as its own task, forward progress, and resolve every job.
///
/// **Guarantees:**
/// - At most `max_concurrent` jobs in flight, independent of pool size
/// - Every dequeued job is resolved: unsupported language, malformed payload,
///   pipeline error and even a panic all produce a failure result
/// - On shutdown: stop dequeuing, let in-flight jobs finish, return

use crate::evaluator::summarize;
use crate::pipeline::ExecutionPipeline;
use crate::queue::{JobQueue, QueuedJob};
use anyhow::Result;
use crucible_common::types::{JobResult, Language, Submission};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

pub struct JobConsumer {
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<ExecutionPipeline>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    dequeue_wait: Duration,
    in_flight: TaskTracker,
    processed: AtomicU64,
}

/// Test count declared by a payload, even one that fails to deserialize.
fn declared_test_count(payload: &serde_json::Value) -> usize {
    payload
        .get("testCases")
        .and_then(serde_json::Value::as_array)
        .map_or(0, Vec::len)
}

impl JobConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pipeline: Arc<ExecutionPipeline>,
        max_concurrent: usize,
        dequeue_wait: Duration,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            queue,
            pipeline,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            dequeue_wait,
            in_flight: TaskTracker::new(),
            processed: AtomicU64::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Consume until `shutdown` fires, then wait for in-flight jobs.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(max_concurrent = self.max_concurrent, "Job consumer started");

        loop {
            // Take a slot before dequeuing so a job is never held without capacity
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => permit?,
            };

            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.queue.dequeue(self.dequeue_wait) => next,
            };

            match next {
                Ok(Some(job)) => {
                    let consumer = Arc::clone(&self);
                    self.in_flight.spawn(async move {
                        consumer.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Queue error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        warn!(in_flight = self.in_flight(), "Shutdown requested, draining in-flight jobs");
        self.in_flight.close();
        self.in_flight.wait().await;
        info!(processed = self.processed(), "Job consumer stopped");
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn process(&self, job: QueuedJob) {
        let started = Instant::now();

        let result = match AssertUnwindSafe(self.judge(&job)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!("Judging panicked");
                JobResult::failure(
                    "Internal error while judging submission",
                    declared_test_count(&job.payload),
                )
            }
        };

        match &result {
            JobResult::Completed { summary, .. } => info!(
                status = ?summary.status,
                passed = summary.passed,
                executed = summary.total_tests_executed,
                percentage = %summary.percentage,
                execution_ms = started.elapsed().as_millis() as u64,
                "Job completed"
            ),
            JobResult::Failed { error, .. } => warn!(error = %error, "Job failed"),
        }

        if let Err(e) = self.queue.resolve(&job, &result).await {
            error!(error = %e, "Failed to resolve job");
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn judge(&self, job: &QueuedJob) -> JobResult {
        let submission: Submission = match serde_json::from_value(job.payload.clone()) {
            Ok(submission) => submission,
            Err(e) => {
                return JobResult::failure(
                    format!("Malformed job payload: {}", e),
                    declared_test_count(&job.payload),
                )
            }
        };
        let total_tests = submission.test_cases.len();

        // Reject before any container is touched
        let language: Language = match submission.language.parse() {
            Ok(language) => language,
            Err(e) => return JobResult::failure(e.to_string(), total_tests),
        };

        info!(
            language = %language,
            problem_id = %submission.problem_id,
            test_cases = total_tests,
            source_size = submission.code.len(),
            "Received job"
        );

        // The pipeline reports synchronously; a forwarder pushes to the queue in order
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let queue = Arc::clone(&self.queue);
        let progress_job = job.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(percent) = rx.recv().await {
                if let Err(e) = queue.report_progress(&progress_job, percent).await {
                    debug!(error = %e, "Progress update dropped");
                }
            }
        });

        let report = move |percent: u8| {
            let _ = tx.send(percent);
        };
        let outcome = self.pipeline.execute(language, &submission, Some(&report)).await;
        drop(report);
        let _ = forwarder.await;

        match outcome {
            Ok(test_results) => {
                let summary = summarize(&test_results);
                JobResult::completed(test_results, summary)
            }
            Err(e) => JobResult::failure(e.to_string(), total_tests),
        }
    }
}
