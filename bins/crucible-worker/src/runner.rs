// Isolated Command Runner
// Runs exactly one command in one running container under a hard timeout.
// Always resolves to a CommandOutcome; runtime failures and timeouts are data, not errors.

use crate::runtime::ContainerRuntime;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exit code reserved for "the runner killed it".
pub const TIMEOUT_EXIT_CODE: i64 = 124;
pub const TIME_LIMIT_EXCEEDED: &str = "Time Limit Exceeded";
/// Exit code used when the command could not be run at all.
pub const RUNTIME_FAILURE_EXIT_CODE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub output: String,
    pub error: String,
    pub exit_code: i64,
}

impl CommandOutcome {
    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE && self.error == TIME_LIMIT_EXCEEDED
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr and stdout joined, for diagnostics such as compiler messages.
    pub fn diagnostics(&self) -> String {
        [self.error.trim_end(), self.output.trim_end()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run `cmd` in `container_id`, feeding `input` (plus a trailing newline) on
/// stdin. One attempt, no retries.
pub async fn run_isolated(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    cmd: &[String],
    input: Option<&str>,
    timeout: Duration,
) -> CommandOutcome {
    let stdin = input.map(|data| format!("{}\n", data).into_bytes());
    let started = Instant::now();

    let result = tokio::time::timeout(timeout, runtime.exec(container_id, cmd, stdin.as_deref())).await;

    match result {
        Ok(Ok(exec)) => {
            debug!(
                container = %container_id,
                exit_code = exec.exit_code,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Command finished"
            );
            CommandOutcome {
                output: exec.stdout,
                error: exec.stderr,
                exit_code: exec.exit_code,
            }
        }
        Ok(Err(e)) => {
            warn!(container = %container_id, error = %e, "Command could not be run");
            CommandOutcome {
                output: String::new(),
                error: e.to_string(),
                exit_code: RUNTIME_FAILURE_EXIT_CODE,
            }
        }
        Err(_) => {
            warn!(
                container = %container_id,
                timeout_ms = timeout.as_millis() as u64,
                "Command timed out, killing"
            );
            // The exec stream is already dropped; make sure nothing keeps running.
            // The kill gets the same budget so a stalled daemon cannot hang the runner.
            match tokio::time::timeout(timeout, runtime.kill_processes(container_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(container = %container_id, error = %e, "Failed to kill timed-out command"),
                Err(_) => warn!(container = %container_id, "Kill of timed-out command did not finish"),
            }
            CommandOutcome {
                output: String::new(),
                error: TIME_LIMIT_EXCEEDED.to_string(),
                exit_code: TIMEOUT_EXIT_CODE,
            }
        }
    }
}
