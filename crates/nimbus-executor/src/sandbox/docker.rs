// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker sandbox.
//!
//! Drives the `docker` CLI to run one container per request:
//!
//! 1. `docker pull` the image (every time; cheap when already present)
//! 2. read the image's default `Cmd` and append the request parameters
//! 3. `docker create` with the task label, resource bounds and the function
//!    port published on an ephemeral host port
//! 4. `docker start`, then `docker wait` raced against the timeout
//! 5. `docker logs`: stdout for exit status 0, stderr otherwise
//! 6. `docker rm --force --volumes` on every path
//!
//! On timeout the container is killed before it is removed.

use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::output::clean_output;
use super::traits::*;
use crate::messages::FunctionOutput;

/// Label put on every container, carrying the task id.
pub const TASK_LABEL: &str = "nimbus.task";

/// Docker sandbox configuration
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Docker CLI binary
    pub docker_bin: String,
    /// CPU limit passed to `--cpus`
    pub cpus: Option<String>,
    /// Memory limit passed to `--memory`
    pub memory: Option<String>,
    /// Container port published on an ephemeral host port
    pub function_port: u16,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            cpus: None,
            memory: None,
            function_port: 8080,
        }
    }
}

impl DockerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            docker_bin: std::env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
            cpus: non_empty_env("NIMBUS_CONTAINER_CPUS"),
            memory: non_empty_env("NIMBUS_CONTAINER_MEMORY"),
            ..Default::default()
        }
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Sandbox running each request in a fresh Docker container.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    config: DockerConfig,
}

impl DockerSandbox {
    /// Create a sandbox with the given configuration.
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Create a sandbox configured from environment variables.
    pub fn from_env() -> Self {
        Self::new(DockerConfig::from_env())
    }

    /// Get the configuration.
    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    async fn docker(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new(&self.config.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output)
    }

    /// Kill a running container. Failures are logged; removal still follows.
    async fn kill_container(&self, container_id: &str) -> bool {
        match self.docker(&["kill", container_id]).await {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    container_id = %container_id,
                    error = %stderr_text(&output),
                    "Failed to kill container"
                );
                false
            }
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Failed to kill container");
                false
            }
        }
    }

    async fn pull(&self, image: &str) -> Result<()> {
        let output = self.docker(&["pull", "--quiet", image]).await?;
        if !output.status.success() {
            return Err(SandboxError::ImagePull {
                image: image.to_string(),
                message: stderr_text(&output),
            });
        }
        debug!(image = %image, "Image pulled");
        Ok(())
    }

    /// Default command declared by the image (`Config.Cmd`).
    async fn default_command(&self, image: &str) -> Result<Vec<String>> {
        let output = self
            .docker(&["image", "inspect", "--format", "{{json .Config.Cmd}}", image])
            .await?;
        if !output.status.success() {
            return Err(SandboxError::ImageInspect {
                image: image.to_string(),
                message: stderr_text(&output),
            });
        }
        parse_command(&output.stdout).map_err(|e| SandboxError::ImageInspect {
            image: image.to_string(),
            message: e.to_string(),
        })
    }

    async fn create(&self, request: &ExecutionRequest, command: &[String]) -> Result<String> {
        let label = format!("{}={}", TASK_LABEL, request.task_id);
        let publish = format!("{}/tcp", self.config.function_port);

        let mut args: Vec<&str> = vec![
            "create",
            "--label",
            label.as_str(),
            "--publish",
            publish.as_str(),
        ];
        if let Some(cpus) = &self.config.cpus {
            args.extend(["--cpus", cpus.as_str()]);
        }
        if let Some(memory) = &self.config.memory {
            args.extend(["--memory", memory.as_str()]);
        }
        args.push(request.image.as_str());
        args.extend(command.iter().map(String::as_str));

        let output = self.docker(&args).await?;
        if !output.status.success() {
            return Err(SandboxError::ContainerCreate(stderr_text(&output)));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(SandboxError::ContainerCreate(
                "docker create returned no container id".to_string(),
            ));
        }
        Ok(container_id)
    }

    async fn run_container(
        &self,
        container_id: &str,
        request: &ExecutionRequest,
    ) -> Result<FunctionOutput> {
        let output = self.docker(&["start", container_id]).await?;
        if !output.status.success() {
            return Err(SandboxError::ContainerStart(stderr_text(&output)));
        }

        let exit_status = match tokio::time::timeout(request.timeout, self.wait(container_id))
            .await
        {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    task_id = %request.task_id,
                    container_id = %container_id,
                    timeout_secs = request.timeout.as_secs(),
                    "Execution timed out, killing container"
                );
                self.kill_container(container_id).await;
                return Err(SandboxError::Timeout(request.timeout));
            }
        };

        let logs = self.docker(&["logs", container_id]).await?;
        if !logs.status.success() {
            return Err(SandboxError::Runtime(format!(
                "failed to read logs: {}",
                stderr_text(&logs)
            )));
        }

        let raw = if exit_status == 0 {
            &logs.stdout
        } else {
            &logs.stderr
        };
        Ok(FunctionOutput::new(clean_output(raw), exit_status))
    }

    async fn wait(&self, container_id: &str) -> Result<i32> {
        let output = self.docker(&["wait", container_id]).await?;
        if !output.status.success() {
            return Err(SandboxError::Runtime(format!(
                "failed to wait for container: {}",
                stderr_text(&output)
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim().parse().map_err(|_| {
            SandboxError::Runtime(format!("unexpected exit status {:?}", text.trim()))
        })
    }

    /// Remove every container labelled with `task_id`.
    ///
    /// Used to clean up after a worker process that was killed before it
    /// could remove its own container.
    pub async fn remove_task_containers(&self, task_id: &uuid::Uuid) -> Result<usize> {
        let filter = format!("label={}={}", TASK_LABEL, task_id);
        let output = self
            .docker(&["ps", "--all", "--quiet", "--filter", &filter])
            .await?;
        if !output.status.success() {
            return Err(SandboxError::Runtime(stderr_text(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let ids: Vec<&str> = stdout.split_whitespace().collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut args = vec!["rm", "--force", "--volumes"];
        args.extend(ids.iter().copied());
        let output = self.docker(&args).await?;
        if !output.status.success() {
            return Err(SandboxError::Runtime(stderr_text(&output)));
        }
        info!(task_id = %task_id, removed = ids.len(), "Removed leftover containers");
        Ok(ids.len())
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn sandbox_type(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, request), fields(task_id = %request.task_id, image = %request.image))]
    async fn execute(&self, request: &ExecutionRequest) -> Result<FunctionOutput> {
        self.pull(&request.image).await?;

        let mut command = self.default_command(&request.image).await?;
        command.extend(request.parameters.iter().cloned());

        let container_id = self.create(request, &command).await?;
        let guard = ContainerGuard::new(&self.config.docker_bin, &container_id);
        debug!(container_id = %container_id, command = ?command, "Container created");

        let result = self.run_container(&container_id, request).await;
        guard.release().await;

        match &result {
            Ok(output) => info!(
                container_id = %container_id,
                exit_status = output.exit_status,
                "Container finished"
            ),
            Err(e) => warn!(container_id = %container_id, error = %e, "Container run failed"),
        }
        result
    }
}

/// Removes a container when released or dropped.
///
/// `release` removes the container and waits for it. If the guard is dropped
/// instead (the execution future was cancelled), removal is started in the
/// background.
struct ContainerGuard {
    docker_bin: String,
    container_id: String,
    released: bool,
}

impl ContainerGuard {
    fn new(docker_bin: &str, container_id: &str) -> Self {
        Self {
            docker_bin: docker_bin.to_string(),
            container_id: container_id.to_string(),
            released: false,
        }
    }

    fn remove_args(&self) -> [&str; 4] {
        ["rm", "--force", "--volumes", &self.container_id]
    }

    async fn release(mut self) {
        self.released = true;
        let result = Command::new(&self.docker_bin)
            .args(self.remove_args())
            .stdin(Stdio::null())
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                debug!(container_id = %self.container_id, "Container removed");
            }
            Ok(output) => {
                warn!(
                    container_id = %self.container_id,
                    error = %stderr_text(&output),
                    "Failed to remove container"
                );
            }
            Err(e) => {
                warn!(container_id = %self.container_id, error = %e, "Failed to remove container");
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(container_id = %self.container_id, "Execution abandoned, removing container");

        let mut command = std::process::Command::new(&self.docker_bin);
        command
            .args(self.remove_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Reap the CLI on the runtime when there is one; otherwise let it
        // outlive this process.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let mut command = Command::from(command);
                handle.spawn(async move {
                    let _ = command.status().await;
                });
            }
            Err(_) => {
                let _ = command.spawn();
            }
        }
    }
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Parse the `{{json .Config.Cmd}}` output: a JSON array or `null`.
fn parse_command(raw: &[u8]) -> std::result::Result<Vec<String>, serde_json::Error> {
    let cmd: Option<Vec<String>> = serde_json::from_slice(raw)?;
    Ok(cmd.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command(b"[\"/bin/sh\",\"-c\",\"echo hi\"]\n").unwrap(),
            vec!["/bin/sh", "-c", "echo hi"]
        );
        assert!(parse_command(b"null\n").unwrap().is_empty());
        assert!(parse_command(b"not json").is_err());
    }

    #[test]
    fn test_config_default() {
        let config = DockerConfig::default();
        assert_eq!(config.docker_bin, "docker");
        assert_eq!(config.function_port, 8080);
        assert!(config.cpus.is_none());
    }

    #[tokio::test]
    async fn test_missing_docker_binary_is_an_error() {
        let sandbox = DockerSandbox::new(DockerConfig {
            docker_bin: "/nonexistent/docker".to_string(),
            ..Default::default()
        });
        let request = ExecutionRequest {
            task_id: uuid::Uuid::new_v4(),
            image: "alpine:latest".to_string(),
            parameters: vec![],
            timeout: Duration::from_secs(5),
        };
        let err = sandbox.execute(&request).await.unwrap_err();
        assert!(matches!(err, SandboxError::Io(_)));
    }

    #[tokio::test]
    async fn test_failed_pull_reports_stderr() {
        // `false` exits 1 for every subcommand.
        let sandbox = DockerSandbox::new(DockerConfig {
            docker_bin: "false".to_string(),
            ..Default::default()
        });
        let request = ExecutionRequest {
            task_id: uuid::Uuid::new_v4(),
            image: "alpine:latest".to_string(),
            parameters: vec![],
            timeout: Duration::from_secs(5),
        };
        let err = sandbox.execute(&request).await.unwrap_err();
        assert!(matches!(err, SandboxError::ImagePull { .. }));
    }

    #[tokio::test]
    async fn test_kill_failure_is_reported() {
        let failing = DockerSandbox::new(DockerConfig {
            docker_bin: "false".to_string(),
            ..Default::default()
        });
        assert!(!failing.kill_container("abc123").await);

        let missing = DockerSandbox::new(DockerConfig {
            docker_bin: "/nonexistent/docker".to_string(),
            ..Default::default()
        });
        assert!(!missing.kill_container("abc123").await);

        let working = DockerSandbox::new(DockerConfig {
            docker_bin: "true".to_string(),
            ..Default::default()
        });
        assert!(working.kill_container("abc123").await);
    }
}
