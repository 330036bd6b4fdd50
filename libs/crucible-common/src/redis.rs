use crate::types::{JobResult, Submission};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Redis queue semantics - defines only semantics, not runtime logic
/// Ensures the worker and the CLI never drift and Redis keys are deterministic

pub const QUEUE_PREFIX: &str = "crucible:queue";
pub const PROCESSING_PREFIX: &str = "crucible:processing";
pub const RESULT_PREFIX: &str = "crucible:result";
pub const STATUS_PREFIX: &str = "crucible:status";
pub const PROGRESS_PREFIX: &str = "crucible:progress";

/// What actually sits in the list: the job id plus the untouched payload.
///
/// `submission` is kept as raw JSON so a malformed payload can still be
/// dequeued, acknowledged and resolved with an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub id: Uuid,
    pub submission: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(submission: &Submission) -> serde_json::Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            submission: serde_json::to_value(submission)?,
            enqueued_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Active,
    Completed,
    Failed,
}

/// Pending list for a queue
pub fn queue_key(queue_name: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, queue_name)
}

/// Per-worker in-flight list; envelopes stay here until acknowledged
pub fn processing_key(queue_name: &str, worker_id: &str) -> String {
    format!("{}:{}:{}", PROCESSING_PREFIX, queue_name, worker_id)
}

pub fn result_key(job_id: &Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

pub fn status_key(job_id: &Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

pub fn progress_key(job_id: &Uuid) -> String {
    format!("{}:{}", PROGRESS_PREFIX, job_id)
}

fn json_error(desc: &'static str, e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, desc, e.to_string()))
}

/// Push a job to the tail of the pending list (FIFO)
pub async fn push_job(
    conn: &mut ConnectionManager,
    queue_name: &str,
    envelope: &JobEnvelope,
) -> RedisResult<()> {
    let payload =
        serde_json::to_string(envelope).map_err(|e| json_error("serialization error", e))?;
    conn.rpush(queue_key(queue_name), payload).await
}

/// Atomically move the head of the pending list into the worker's
/// processing list. Returns the raw envelope text, which doubles as the
/// acknowledgement receipt.
pub async fn pop_job(
    conn: &mut ConnectionManager,
    queue_name: &str,
    worker_id: &str,
    timeout_seconds: f64,
) -> RedisResult<Option<String>> {
    redis::cmd("BLMOVE")
        .arg(queue_key(queue_name))
        .arg(processing_key(queue_name, worker_id))
        .arg("LEFT")
        .arg("RIGHT")
        .arg(timeout_seconds)
        .query_async(conn)
        .await
}

/// Drop an envelope from the processing list once its result is stored
pub async fn ack_job(
    conn: &mut ConnectionManager,
    queue_name: &str,
    worker_id: &str,
    receipt: &str,
) -> RedisResult<()> {
    let _: i64 = conn
        .lrem(processing_key(queue_name, worker_id), 1, receipt)
        .await?;
    Ok(())
}

/// Move everything left in this worker's processing list back to the head
/// of the pending list. Returns how many envelopes were recovered.
pub async fn requeue_unacked(
    conn: &mut ConnectionManager,
    queue_name: &str,
    worker_id: &str,
) -> RedisResult<usize> {
    let mut recovered = 0;
    loop {
        let moved: Option<String> = redis::cmd("LMOVE")
            .arg(processing_key(queue_name, worker_id))
            .arg(queue_key(queue_name))
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(conn)
            .await?;
        match moved {
            Some(_) => recovered += 1,
            None => return Ok(recovered),
        }
    }
}

async fn set_with_ttl(
    conn: &mut ConnectionManager,
    key: &str,
    value: &str,
    ttl_secs: u64,
) -> RedisResult<()> {
    redis::cmd("SET")
        .arg(key)
        .arg(value)
        .arg("EX")
        .arg(ttl_secs)
        .query_async(conn)
        .await
}

fn state_text(state: JobState) -> &'static str {
    match state {
        JobState::Active => "active",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
    }
}

/// Record fractional completion (0-100) and mark the job active
pub async fn set_progress(
    conn: &mut ConnectionManager,
    job_id: &Uuid,
    percent: u8,
    ttl_secs: u64,
) -> RedisResult<()> {
    set_with_ttl(conn, &progress_key(job_id), &percent.min(100).to_string(), ttl_secs).await?;
    set_with_ttl(conn, &status_key(job_id), state_text(JobState::Active), ttl_secs).await
}

/// Store the terminal result and state of a job
pub async fn store_result(
    conn: &mut ConnectionManager,
    job_id: &Uuid,
    result: &JobResult,
    ttl_secs: u64,
) -> RedisResult<()> {
    let payload = serde_json::to_string(result).map_err(|e| json_error("serialization error", e))?;
    set_with_ttl(conn, &result_key(job_id), &payload, ttl_secs).await?;

    let state = if result.is_success() {
        JobState::Completed
    } else {
        JobState::Failed
    };
    set_with_ttl(conn, &status_key(job_id), state_text(state), ttl_secs).await
}

pub async fn get_result(
    conn: &mut ConnectionManager,
    job_id: &Uuid,
) -> RedisResult<Option<JobResult>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;
    payload
        .map(|data| serde_json::from_str(&data).map_err(|e| json_error("deserialization error", e)))
        .transpose()
}

pub async fn get_state(
    conn: &mut ConnectionManager,
    job_id: &Uuid,
) -> RedisResult<Option<JobState>> {
    let raw: Option<String> = conn.get(status_key(job_id)).await?;
    Ok(raw.and_then(|s| match s.as_str() {
        "active" => Some(JobState::Active),
        "completed" => Some(JobState::Completed),
        "failed" => Some(JobState::Failed),
        _ => None,
    }))
}

pub async fn get_progress(conn: &mut ConnectionManager, job_id: &Uuid) -> RedisResult<Option<u8>> {
    conn.get(progress_key(job_id)).await
}
