/// Execution Pipeline - One Submission End-to-End
///
/// **Flow (strictly sequential):**
/// 1. Acquire a container for the language
/// 2. Upload the source into the scratch mount
/// 3. Compile, if the language has a compile step
/// 4. Run test cases in index order, stopping at the first failure
/// 5. Demolish the container, always
///
/// A failed compile yields exactly one compilation-error outcome and no test
/// runs. Infrastructure failures (no container, upload failed) are returned
/// as `PipelineError` after cleanup has run.

use crate::evaluator::evaluate_test;
use crate::pool::{PoolManager, SandboxContainer};
use crate::runner::run_isolated;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crucible_common::languages::{LanguageConfig, LanguageConfigManager};
use crucible_common::types::{Language, Submission, TestCase, TestOutcome};
use futures_util::stream::{self, Stream, StreamExt};
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Safety limits to keep pathological payloads away from the sandbox
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Receives integer completion percentages (0-100).
pub type ProgressFn = dyn Fn(u8) + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Source code exceeds maximum size of {limit} bytes")]
    SourceTooLarge { limit: usize },

    #[error("Input of test case {index} exceeds maximum size of {limit} bytes")]
    InputTooLarge { index: usize, limit: usize },

    #[error("Language '{0}' is not configured on this worker")]
    LanguageNotConfigured(Language),

    #[error("Sandbox unavailable: {0}")]
    Sandbox(#[from] RuntimeError),

    #[error("Failed to upload source code: {0}")]
    Injection(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub compile_timeout: Duration,
    pub run_timeout: Duration,
    pub inject_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            compile_timeout: Duration::from_secs(5),
            run_timeout: Duration::from_secs(2),
            inject_timeout: Duration::from_secs(5),
        }
    }
}

/// Exclusive use of one container, demolished exactly once.
///
/// `release` is the normal path. If the pipeline future is dropped or panics
/// first, `Drop` hands the container to a background task instead.
struct ContainerLease {
    pool: Arc<PoolManager>,
    container: Option<SandboxContainer>,
}

impl ContainerLease {
    fn new(pool: Arc<PoolManager>, container: SandboxContainer) -> Self {
        Self {
            pool,
            container: Some(container),
        }
    }

    fn container(&self) -> &SandboxContainer {
        // Only `release` and `drop` take it, and both consume the lease
        self.container.as_ref().expect("lease already released")
    }

    async fn release(mut self) {
        if let Some(container) = self.container.take() {
            self.pool.demolish(container).await;
        }
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        if let Some(container) = self.container.take() {
            warn!(container = %container.name, "Pipeline aborted, demolishing in background");
            let pool = Arc::clone(&self.pool);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { pool.demolish(container).await });
                }
                Err(_) => error!(
                    container = %container.name,
                    "No runtime to demolish container, it will be reaped on next startup"
                ),
            }
        }
    }
}

fn percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((completed * 100) / total).min(100) as u8
}

pub struct ExecutionPipeline {
    pool: Arc<PoolManager>,
    runtime: Arc<dyn ContainerRuntime>,
    languages: LanguageConfigManager,
    limits: ExecutionLimits,
}

impl ExecutionPipeline {
    pub fn new(
        pool: Arc<PoolManager>,
        runtime: Arc<dyn ContainerRuntime>,
        languages: LanguageConfigManager,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            pool,
            runtime,
            languages,
            limits,
        }
    }

    /// Judge `submission` in a fresh sandbox.
    #[tracing::instrument(
        skip_all,
        fields(
            language = %language,
            problem_id = %submission.problem_id,
            test_count = submission.test_cases.len(),
        )
    )]
    pub async fn execute(
        &self,
        language: Language,
        submission: &Submission,
        progress: Option<&ProgressFn>,
    ) -> Result<Vec<TestOutcome>, PipelineError> {
        if submission.code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(PipelineError::SourceTooLarge {
                limit: MAX_SOURCE_CODE_BYTES,
            });
        }
        if let Some(index) = submission
            .test_cases
            .iter()
            .position(|tc| tc.input.len() > MAX_TEST_INPUT_BYTES)
        {
            return Err(PipelineError::InputTooLarge {
                index,
                limit: MAX_TEST_INPUT_BYTES,
            });
        }

        let config = self
            .languages
            .get(language)
            .ok_or(PipelineError::LanguageNotConfigured(language))?;

        let started = Instant::now();
        let container = self.pool.acquire(language).await?;
        debug!(container = %container.name, origin = %container.origin, "Container acquired");

        let lease = ContainerLease::new(Arc::clone(&self.pool), container);
        let result = self.run_in(lease.container(), config, submission, progress).await;
        lease.release().await;

        match &result {
            Ok(outcomes) => info!(
                executed = outcomes.len(),
                passed = outcomes.iter().filter(|o| o.passed).count(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Submission judged"
            ),
            Err(e) => warn!(error = %e, "Submission could not be judged"),
        }

        result
    }

    async fn run_in(
        &self,
        container: &SandboxContainer,
        config: &LanguageConfig,
        submission: &Submission,
        progress: Option<&ProgressFn>,
    ) -> Result<Vec<TestOutcome>, PipelineError> {
        self.inject_source(container, config, &submission.code).await?;

        if let Some(compile) = &config.compile {
            let compiled = run_isolated(
                self.runtime.as_ref(),
                &container.id,
                compile,
                None,
                self.limits.compile_timeout,
            )
            .await;

            if !compiled.succeeded() {
                info!(exit_code = compiled.exit_code, "Compilation failed");
                return Ok(vec![TestOutcome::compilation_failure(&compiled.diagnostics())]);
            }
        }

        let total = submission.test_cases.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut runs = pin!(self.test_runs(container, config, &submission.test_cases));

        while let Some(outcome) = runs.next().await {
            let passed = outcome.passed;
            debug!(index = outcome.index, passed = passed, "Test case finished");
            outcomes.push(outcome);

            if !passed {
                // Fail fast: later test cases are never started
                break;
            }
            if let Some(report) = progress {
                report(percent(outcomes.len(), total));
            }
        }

        Ok(outcomes)
    }

    /// Lazily run each test case in order; nothing runs until polled.
    fn test_runs<'a>(
        &'a self,
        container: &'a SandboxContainer,
        config: &'a LanguageConfig,
        test_cases: &'a [TestCase],
    ) -> impl Stream<Item = TestOutcome> + 'a {
        stream::iter(test_cases.iter().enumerate()).then(move |(index, test_case)| async move {
            let run = run_isolated(
                self.runtime.as_ref(),
                &container.id,
                &config.run,
                Some(test_case.input.as_str()),
                self.limits.run_timeout,
            )
            .await;
            if run.timed_out() {
                info!(index = index, "Test case hit the time limit");
            }
            evaluate_test(index, test_case, &run)
        })
    }

    /// Stream the source into the scratch mount over stdin.
    ///
    /// The root filesystem is read-only and archive uploads do not reach
    /// tmpfs mounts, so the file is written from inside the container.
    async fn inject_source(
        &self,
        container: &SandboxContainer,
        config: &LanguageConfig,
        code: &str,
    ) -> Result<(), PipelineError> {
        let write_cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > {}", config.source_path()),
        ];

        let written = run_isolated(
            self.runtime.as_ref(),
            &container.id,
            &write_cmd,
            Some(code),
            self.limits.inject_timeout,
        )
        .await;

        if !written.succeeded() {
            return Err(PipelineError::Injection(written.diagnostics()));
        }
        Ok(())
    }
}
