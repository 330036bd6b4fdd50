/// Container Runtime Client
///
/// **Core Responsibility:**
/// Thin async seam over the container daemon: pull, create+start, exec with
/// stdin, kill, remove, list.
///
/// **Critical Architectural Boundary:**
/// - Knows HOW to talk to Docker
/// - Does NOT know about pools, timeouts or test cases
/// - Does NOT decide sandbox limits (it applies a `SandboxSpec` verbatim)
///
/// The pool, runner and pipeline only see `dyn ContainerRuntime`, so tests
/// drive them with an in-memory runtime.

use crate::sandbox::{SandboxSpec, MANAGED_LABEL};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Each captured stream is truncated past this size.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("failed to create container {name}: {reason}")]
    ContainerCreate { name: String, reason: String },

    #[error("exec in container {container} failed: {reason}")]
    Exec { container: String, reason: String },

    #[error("failed to remove container {container}: {reason}")]
    Remove { container: String, reason: String },

    #[error("container runtime error: {0}")]
    Api(#[from] bollard::errors::Error),
}

/// Raw result of one exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make sure `image` is present locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create and start a container; returns its runtime id.
    async fn create_sandbox(&self, name: &str, spec: &SandboxSpec) -> Result<String, RuntimeError>;

    /// Run `cmd` inside a running container and wait for it to exit.
    /// When `stdin` is given it is written in full and the stream closed.
    async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError>;

    /// SIGKILL every process in the container except its init process.
    async fn kill_processes(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container.
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Ids of every container carrying the sandbox label.
    async fn list_sandboxes(&self) -> Result<Vec<String>, RuntimeError>;
}

/// Append `chunk` to `buf` without letting it grow past `MAX_CAPTURE_BYTES`.
fn capture(buf: &mut Vec<u8>, chunk: &[u8]) {
    let room = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

/// Docker-backed runtime using Bollard
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> anyhow::Result<Self> {
        use anyhow::Context;
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    fn container_config(spec: &SandboxSpec) -> Config<String> {
        let host_config = bollard::models::HostConfig {
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_swap_bytes),
            nano_cpus: Some(spec.nano_cpus),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some("none".to_string()),
            cap_drop: Some(spec.cap_drop.clone()),
            security_opt: Some(spec.security_opt.clone()),
            readonly_rootfs: Some(spec.readonly_rootfs),
            tmpfs: Some(HashMap::from([(
                spec.scratch_dir.clone(),
                spec.scratch_options.clone(),
            )])),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.idle_command.clone()),
            // Override image entrypoints so the idle command runs as-is
            entrypoint: Some(vec![]),
            network_disabled: Some(spec.network_disabled),
            working_dir: Some(spec.scratch_dir.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| RuntimeError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn create_sandbox(&self, name: &str, spec: &SandboxSpec) -> Result<String, RuntimeError> {
        let create_options = CreateContainerOptions {
            name,
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), Self::container_config(spec))
            .await
            .map_err(|e| RuntimeError::ContainerCreate {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            // A created-but-stopped container would otherwise leak
            if let Err(remove_err) = self.remove(&container.id).await {
                warn!(container = %name, error = %remove_err, "Failed to remove unstartable container");
            }
            return Err(RuntimeError::ContainerCreate {
                name: name.to_string(),
                reason: format!("start failed: {}", e),
            });
        }

        Ok(container.id)
    }

    async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdin: Some(stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.docker.create_exec(container_id, exec_config).await?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let StartExecResults::Attached { mut output, mut input } =
            self.docker.start_exec(&exec.id, Some(start_config)).await?
        else {
            return Err(RuntimeError::Exec {
                container: container_id.to_string(),
                reason: "exec started detached".to_string(),
            });
        };

        // Feed stdin while draining output so a chatty process cannot
        // deadlock against a full input pipe.
        let feed = async {
            if let Some(data) = stdin {
                if let Err(e) = input.write_all(data).await {
                    // The process may exit without reading its input
                    debug!(error = %e, "stdin write interrupted");
                }
                let _ = input.shutdown().await;
            }
        };

        let drain = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            while let Some(msg) = output.next().await {
                match msg? {
                    LogOutput::StdOut { message } => capture(&mut stdout, &message),
                    LogOutput::StdErr { message } => capture(&mut stderr, &message),
                    _ => {}
                }
            }
            Ok::<_, bollard::errors::Error>((stdout, stderr))
        };

        let ((), drained) = tokio::join!(feed, drain);
        let (stdout, stderr) = drained?;

        let inspect = self.docker.inspect_exec(&exec.id).await?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    async fn kill_processes(&self, container_id: &str) -> Result<(), RuntimeError> {
        // kill(-1) signals everything except PID 1 and the caller
        let exec_config = CreateExecOptions {
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "kill -9 -1 2>/dev/null; true".to_string(),
            ]),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container_id, exec_config).await?;
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(container_id, Some(remove_options))
            .await
            .map_err(|e| RuntimeError::Remove {
                container: container_id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn list_sandboxes(&self) -> Result<Vec<String>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{}=true", MANAGED_LABEL)],
            )]),
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
