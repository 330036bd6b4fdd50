// Job queue seam
// The consumer only needs dequeue-with-ack, progress and terminal resolve; Redis is one implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use crucible_common::redis::{self as queue_redis, JobEnvelope};
use crucible_common::types::JobResult;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// A dequeued job that has not been resolved yet.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub payload: serde_json::Value,
    /// Opaque token the queue needs to acknowledge this delivery.
    pub receipt: String,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Wait up to `wait` for the next job.
    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>>;

    async fn report_progress(&self, job: &QueuedJob, percent: u8) -> Result<()>;

    /// Store the terminal result and acknowledge the delivery.
    async fn resolve(&self, job: &QueuedJob, result: &JobResult) -> Result<()>;
}

pub struct RedisJobQueue {
    conn: ConnectionManager,
    /// Dedicated to the blocking BLMOVE; a multiplexed connection would hold
    /// every progress write and ack behind it for up to the dequeue wait.
    blocking: ConnectionManager,
    queue_name: String,
    worker_id: String,
    result_ttl_secs: u64,
}

impl RedisJobQueue {
    pub fn new(
        conn: ConnectionManager,
        blocking: ConnectionManager,
        queue_name: &str,
        worker_id: &str,
        result_ttl_secs: u64,
    ) -> Self {
        Self {
            conn,
            blocking,
            queue_name: queue_name.to_string(),
            worker_id: worker_id.to_string(),
            result_ttl_secs,
        }
    }

    /// Put back anything a previous run of this worker dequeued but never acknowledged.
    pub async fn recover_unacked(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let recovered = queue_redis::requeue_unacked(&mut conn, &self.queue_name, &self.worker_id)
            .await
            .context("Failed to requeue unacknowledged jobs")?;
        if recovered > 0 {
            info!(recovered = recovered, worker_id = %self.worker_id, "Requeued unacknowledged jobs");
        }
        Ok(recovered)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>> {
        let mut blocking = self.blocking.clone();
        let raw = queue_redis::pop_job(&mut blocking, &self.queue_name, &self.worker_id, wait.as_secs_f64())
            .await
            .context("Failed to pop job")?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<JobEnvelope>(&raw) {
            Ok(envelope) => Ok(Some(QueuedJob {
                id: envelope.id,
                payload: envelope.submission,
                receipt: raw,
            })),
            Err(e) => {
                // Nothing to resolve against without an id; drop the delivery.
                warn!(error = %e, "Discarding unreadable queue entry");
                let mut conn = self.conn.clone();
                queue_redis::ack_job(&mut conn, &self.queue_name, &self.worker_id, &raw)
                    .await
                    .context("Failed to discard unreadable entry")?;
                Ok(None)
            }
        }
    }

    async fn report_progress(&self, job: &QueuedJob, percent: u8) -> Result<()> {
        let mut conn = self.conn.clone();
        queue_redis::set_progress(&mut conn, &job.id, percent, self.result_ttl_secs)
            .await
            .context("Failed to report progress")
    }

    async fn resolve(&self, job: &QueuedJob, result: &JobResult) -> Result<()> {
        let mut conn = self.conn.clone();
        queue_redis::store_result(&mut conn, &job.id, result, self.result_ttl_secs)
            .await
            .context("Failed to store result")?;
        queue_redis::ack_job(&mut conn, &self.queue_name, &self.worker_id, &job.receipt)
            .await
            .context("Failed to acknowledge job")
    }
}

/// These tests require a running Redis instance
#[cfg(test)]
mod tests {
    use super::*;
    use crucible_common::types::{ProblemId, Submission};
    use std::sync::Arc;
    use std::time::Instant;

    async fn connect() -> (redis::Client, ConnectionManager, ConnectionManager) {
        let client = redis::Client::open("redis://127.0.0.1:6379").expect("Failed to create Redis client");
        let conn = ConnectionManager::new(client.clone()).await.expect("Failed to connect to Redis");
        let blocking = ConnectionManager::new(client.clone()).await.expect("Failed to connect to Redis");
        (client, conn, blocking)
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_resolve_not_delayed_by_pending_dequeue() {
        let (_client, conn, blocking) = connect().await;
        let queue_name = format!("test-{}", Uuid::new_v4());
        let queue = Arc::new(RedisJobQueue::new(conn.clone(), blocking, &queue_name, "w1", 60));

        let submission = Submission {
            code: "print(1)".to_string(),
            language: "python".to_string(),
            problem_id: ProblemId::Number(1),
            test_cases: vec![],
        };
        let envelope = JobEnvelope::new(&submission).unwrap();
        let mut push_conn = conn.clone();
        queue_redis::push_job(&mut push_conn, &queue_name, &envelope).await.unwrap();
        let job = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(job.id, envelope.id);

        // Park a blocking dequeue on the now-empty queue
        let parked = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.dequeue(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        queue.report_progress(&job, 50).await.unwrap();
        queue
            .resolve(&job, &JobResult::failure("test", 0))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1), "resolve waited on the blocking dequeue");

        let mut check = conn.clone();
        assert!(queue_redis::get_result(&mut check, &job.id).await.unwrap().is_some());
        parked.abort();
    }
}
