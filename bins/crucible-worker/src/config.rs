// Runtime settings for the Crucible worker
use crate::pipeline::ExecutionLimits;
use crate::sandbox::SandboxProfile;
use anyhow::{bail, Result};
use crucible_common::config::{env_lookup, setting_or, QueueSettings};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound accepted for the per-container process limit.
pub const MAX_PIDS_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: QueueSettings,
    pub worker_id: String,
    pub pool_size: usize,
    pub max_concurrent_jobs: usize,
    pub compile_timeout_ms: u64,
    pub run_timeout_ms: u64,
    pub inject_timeout_ms: u64,
    pub dequeue_wait_secs: u64,
    pub sandbox_memory_mb: u32,
    pub sandbox_cpus: f64,
    pub sandbox_pids_limit: u32,
    pub sandbox_scratch_mb: u32,
    pub health_addr: SocketAddr,
    pub languages_config: PathBuf,
}

fn default_worker_id<F>(lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup("HOSTNAME")
        .filter(|host| !host.trim().is_empty())
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
}

impl WorkerSettings {
    pub fn from_lookup<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings = Self {
            queue: QueueSettings::from_lookup(lookup)?,
            worker_id: setting_or(lookup, "WORKER_ID", default_worker_id(lookup))?,
            pool_size: setting_or(lookup, "POOL_SIZE", 2)?,
            max_concurrent_jobs: setting_or(lookup, "MAX_CONCURRENT_JOBS", 5)?,
            compile_timeout_ms: setting_or(lookup, "COMPILE_TIMEOUT_MS", 5_000)?,
            run_timeout_ms: setting_or(lookup, "RUN_TIMEOUT_MS", 2_000)?,
            inject_timeout_ms: setting_or(lookup, "INJECT_TIMEOUT_MS", 5_000)?,
            dequeue_wait_secs: setting_or(lookup, "DEQUEUE_WAIT_SECS", 5)?,
            sandbox_memory_mb: setting_or(lookup, "SANDBOX_MEMORY_MB", 512)?,
            sandbox_cpus: setting_or(lookup, "SANDBOX_CPUS", 0.5)?,
            sandbox_pids_limit: setting_or(lookup, "SANDBOX_PIDS_LIMIT", 50)?,
            sandbox_scratch_mb: setting_or(lookup, "SANDBOX_SCRATCH_MB", 50)?,
            health_addr: setting_or(lookup, "HEALTH_ADDR", SocketAddr::from(([0, 0, 0, 0], 9090)))?,
            languages_config: setting_or(lookup, "LANGUAGES_CONFIG", PathBuf::from("config/languages.json"))?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            bail!("MAX_CONCURRENT_JOBS must be at least 1");
        }
        if self.sandbox_pids_limit == 0 || self.sandbox_pids_limit > MAX_PIDS_LIMIT {
            bail!("SANDBOX_PIDS_LIMIT must be between 1 and {}", MAX_PIDS_LIMIT);
        }
        if self.sandbox_memory_mb == 0 || self.sandbox_scratch_mb == 0 {
            bail!("SANDBOX_MEMORY_MB and SANDBOX_SCRATCH_MB must be positive");
        }
        if !self.sandbox_cpus.is_finite() || self.sandbox_cpus <= 0.0 {
            bail!("SANDBOX_CPUS must be a positive number of CPUs");
        }
        if self.run_timeout_ms == 0 || self.compile_timeout_ms == 0 || self.inject_timeout_ms == 0 {
            bail!("Timeouts must be positive");
        }
        Ok(())
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            compile_timeout: Duration::from_millis(self.compile_timeout_ms),
            run_timeout: Duration::from_millis(self.run_timeout_ms),
            inject_timeout: Duration::from_millis(self.inject_timeout_ms),
        }
    }

    pub fn profile(&self) -> SandboxProfile {
        SandboxProfile {
            memory_mb: self.sandbox_memory_mb,
            cpus: self.sandbox_cpus,
            pids_limit: self.sandbox_pids_limit,
            scratch_mb: self.sandbox_scratch_mb,
        }
    }

    pub fn dequeue_wait(&self) -> Duration {
        Duration::from_secs(self.dequeue_wait_secs)
    }
}
