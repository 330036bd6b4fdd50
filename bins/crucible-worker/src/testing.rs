// In-memory collaborators for unit tests: a scriptable container runtime and a job queue.

use crate::queue::{JobQueue, QueuedJob};
use crate::runtime::{ContainerRuntime, ExecOutput, RuntimeError};
use crate::sandbox::SandboxSpec;
use async_trait::async_trait;
use crucible_common::types::JobResult;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecCall {
    pub container: String,
    pub command: Vec<String>,
    pub stdin: Option<String>,
}

impl ExecCall {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// Source upload issued by the pipeline (`sh -c 'cat > /tmp/...'`).
    pub fn is_injection(&self) -> bool {
        self.command.first().map(String::as_str) == Some("sh") && self.command_line().contains("cat >")
    }
}

pub enum MockExec {
    Exit {
        code: i64,
        stdout: String,
        stderr: String,
        delay: Duration,
    },
    Hang,
    Fail(String),
}

impl MockExec {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::exit(0, stdout, "")
    }

    pub fn exit(code: i64, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        MockExec::Exit {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn after(self, wait: Duration) -> Self {
        match self {
            MockExec::Exit { code, stdout, stderr, .. } => MockExec::Exit {
                code,
                stdout,
                stderr,
                delay: wait,
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedSandbox {
    pub name: String,
    pub id: String,
    pub spec: SandboxSpec,
}

type ExecHandler = Box<dyn Fn(&ExecCall) -> MockExec + Send + Sync>;

pub struct MockRuntime {
    handler: ExecHandler,
    created: Mutex<Vec<CreatedSandbox>>,
    removed: Mutex<HashMap<String, usize>>,
    execs: Mutex<Vec<ExecCall>>,
    in_use: Mutex<HashSet<String>>,
    peak_in_use: AtomicUsize,
    kills: AtomicUsize,
    failing_images: Mutex<HashSet<String>>,
    fail_creates: AtomicBool,
    fail_injection: AtomicBool,
    fail_removes: AtomicBool,
    hang_kills: AtomicBool,
    create_delay: Mutex<Duration>,
    leftovers: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ExecCall) -> MockExec + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            created: Mutex::new(Vec::new()),
            removed: Mutex::new(HashMap::new()),
            execs: Mutex::new(Vec::new()),
            in_use: Mutex::new(HashSet::new()),
            peak_in_use: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            failing_images: Mutex::new(HashSet::new()),
            fail_creates: AtomicBool::new(false),
            fail_injection: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
            hang_kills: AtomicBool::new(false),
            create_delay: Mutex::new(Duration::ZERO),
            leftovers: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_image(&self, image: &str) {
        self.failing_images.lock().unwrap().insert(image.to_string());
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_injection(&self, fail: bool) {
        self.fail_injection.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub fn set_hang_kills(&self, hang: bool) {
        self.hang_kills.store(hang, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn add_leftover(&self, id: &str) {
        self.leftovers.lock().unwrap().push(id.to_string());
    }

    pub fn created(&self) -> Vec<CreatedSandbox> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_by_id(&self, id: &str) -> Option<CreatedSandbox> {
        self.created().into_iter().find(|c| c.id == id)
    }

    pub fn removal_count(&self, id: &str) -> usize {
        self.removed.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_removals(&self) -> usize {
        self.removed.lock().unwrap().values().sum()
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.execs.lock().unwrap().clone()
    }

    /// Exec calls that ran user programs (uploads excluded).
    pub fn program_calls(&self) -> Vec<ExecCall> {
        self.exec_calls().into_iter().filter(|c| !c.is_injection()).collect()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn peak_in_use(&self) -> usize {
        self.peak_in_use.load(Ordering::SeqCst)
    }

    fn mark_in_use(&self, id: &str) {
        let mut in_use = self.in_use.lock().unwrap();
        in_use.insert(id.to_string());
        self.peak_in_use.fetch_max(in_use.len(), Ordering::SeqCst);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.failing_images.lock().unwrap().contains(image) {
            return Err(RuntimeError::ImagePull {
                image: image.to_string(),
                reason: "registry unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn create_sandbox(&self, name: &str, spec: &SandboxSpec) -> Result<String, RuntimeError> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(RuntimeError::ContainerCreate {
                name: name.to_string(),
                reason: "no space left on device".to_string(),
            });
        }
        let id = format!("id-{}", name);
        self.created.lock().unwrap().push(CreatedSandbox {
            name: name.to_string(),
            id: id.clone(),
            spec: spec.clone(),
        });
        Ok(id)
    }

    async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        let call = ExecCall {
            container: container_id.to_string(),
            command: cmd.to_vec(),
            stdin: stdin.map(|data| String::from_utf8_lossy(data).into_owned()),
        };
        self.execs.lock().unwrap().push(call.clone());
        self.mark_in_use(container_id);

        let scripted = if call.is_injection() {
            if self.fail_injection.load(Ordering::SeqCst) {
                MockExec::exit(1, "", "sh: can't create: Read-only file system")
            } else {
                MockExec::ok("")
            }
        } else {
            (self.handler)(&call)
        };

        match scripted {
            MockExec::Exit { code, stdout, stderr, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(ExecOutput {
                    stdout,
                    stderr,
                    exit_code: code,
                })
            }
            MockExec::Hang => std::future::pending().await,
            MockExec::Fail(reason) => Err(RuntimeError::Exec {
                container: container_id.to_string(),
                reason,
            }),
        }
    }

    async fn kill_processes(&self, _container_id: &str) -> Result<(), RuntimeError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if self.hang_kills.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        *self
            .removed
            .lock()
            .unwrap()
            .entry(container_id.to_string())
            .or_insert(0) += 1;
        self.in_use.lock().unwrap().remove(container_id);
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(RuntimeError::Remove {
                container: container_id.to_string(),
                reason: "removal already in progress".to_string(),
            });
        }
        Ok(())
    }

    async fn list_sandboxes(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.leftovers.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct MockQueue {
    pending: Mutex<VecDeque<QueuedJob>>,
    progress: Mutex<Vec<(Uuid, u8)>>,
    resolved: Mutex<Vec<(Uuid, JobResult)>>,
}

impl MockQueue {
    pub fn push(&self, payload: serde_json::Value) -> Uuid {
        let id = Uuid::new_v4();
        self.pending.lock().unwrap().push_back(QueuedJob {
            id,
            payload,
            receipt: id.to_string(),
        });
        id
    }

    pub fn progress_for(&self, id: Uuid) -> Vec<u8> {
        self.progress
            .lock()
            .unwrap()
            .iter()
            .filter(|(job, _)| *job == id)
            .map(|(_, pct)| *pct)
            .collect()
    }

    pub fn resolved(&self) -> Vec<(Uuid, JobResult)> {
        self.resolved.lock().unwrap().clone()
    }

    pub fn result_for(&self, id: Uuid) -> Option<JobResult> {
        self.resolved()
            .into_iter()
            .find(|(job, _)| *job == id)
            .map(|(_, result)| result)
    }
}

#[async_trait]
impl JobQueue for MockQueue {
    async fn dequeue(&self, wait: Duration) -> anyhow::Result<Option<QueuedJob>> {
        let next = self.pending.lock().unwrap().pop_front();
        if next.is_none() {
            tokio::time::sleep(wait.min(Duration::from_millis(10))).await;
        }
        Ok(next)
    }

    async fn report_progress(&self, job: &QueuedJob, percent: u8) -> anyhow::Result<()> {
        self.progress.lock().unwrap().push((job.id, percent));
        Ok(())
    }

    async fn resolve(&self, job: &QueuedJob, result: &JobResult) -> anyhow::Result<()> {
        self.resolved.lock().unwrap().push((job.id, result.clone()));
        Ok(())
    }
}

/// Poll `condition` until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
