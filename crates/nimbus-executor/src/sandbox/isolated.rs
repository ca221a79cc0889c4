// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-isolated sandbox.
//!
//! Each execution runs in its own worker process (by default this binary's
//! hidden `sandbox-worker` subcommand), so a crash while handling untrusted
//! code cannot take the orchestrator down with it.
//!
//! ```text
//! IsolatedSandbox ──stdin: ExecutionRequest (JSON)──▶ sandbox-worker ──▶ DockerSandbox
//!                 ◀──stdout: WorkerResponse (JSON)───
//! ```
//!
//! The supervisor bounds concurrency with a semaphore and enforces the
//! timeout itself: a worker that overruns `timeout + grace_period` gets
//! SIGTERM, then SIGKILL, and is reaped. Containers it left behind are
//! removed by their task label.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use super::docker::DockerSandbox;
use super::traits::*;
use crate::messages::FunctionOutput;

/// Subcommand that runs a single execution and exits.
pub const WORKER_SUBCOMMAND: &str = "sandbox-worker";

/// Category of a failed worker execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    /// The container ran into its timeout.
    Timeout,
    /// Any other sandbox failure.
    Sandbox,
    /// The worker was told to stop before the execution finished.
    Terminated,
}

/// Message a worker writes to stdout before exiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// The function ran.
    Ok {
        /// Function output.
        output: FunctionOutput,
    },
    /// The execution failed.
    Error {
        /// Failure category.
        kind: WorkerErrorKind,
        /// Failure text.
        message: String,
    },
}

impl WorkerResponse {
    /// Wrap an execution result.
    pub fn from_result(result: Result<FunctionOutput>) -> Self {
        match result {
            Ok(output) => WorkerResponse::Ok { output },
            Err(SandboxError::Timeout(after)) => WorkerResponse::Error {
                kind: WorkerErrorKind::Timeout,
                message: SandboxError::Timeout(after).to_string(),
            },
            Err(e) => WorkerResponse::Error {
                kind: WorkerErrorKind::Sandbox,
                message: e.to_string(),
            },
        }
    }

    /// Turn the response back into an execution result.
    pub fn into_result(self, timeout: Duration) -> Result<FunctionOutput> {
        match self {
            WorkerResponse::Ok { output } => Ok(output),
            WorkerResponse::Error {
                kind: WorkerErrorKind::Timeout,
                ..
            } => Err(SandboxError::Timeout(timeout)),
            WorkerResponse::Error { message, .. } => Err(SandboxError::Worker(message)),
        }
    }
}

/// Read an execution request from a worker's input.
pub async fn read_request<R: AsyncRead + Unpin>(mut input: R) -> Result<ExecutionRequest> {
    let mut buf = Vec::new();
    input.read_to_end(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Write a worker response, newline terminated.
pub async fn write_response<W: AsyncWrite + Unpin>(
    mut output: W,
    response: &WorkerResponse,
) -> Result<()> {
    let mut buf = serde_json::to_vec(response)?;
    buf.push(b'\n');
    output.write_all(&buf).await?;
    output.flush().await?;
    Ok(())
}

/// Serve one request: read it, execute it, write the response.
///
/// If `terminate` resolves first the execution is abandoned and a
/// `terminated` response is written instead.
pub async fn serve_worker_request<R, W, T>(
    sandbox: &dyn Sandbox,
    input: R,
    output: W,
    terminate: T,
) -> Result<ExecutionRequest>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Future<Output = ()>,
{
    let request = read_request(input).await?;
    debug!(task_id = %request.task_id, image = %request.image, "Worker received request");

    let response = tokio::select! {
        result = sandbox.execute(&request) => WorkerResponse::from_result(result),
        _ = terminate => {
            warn!(task_id = %request.task_id, "Worker terminated during execution");
            WorkerResponse::Error {
                kind: WorkerErrorKind::Terminated,
                message: "sandbox worker terminated".to_string(),
            }
        }
    };

    write_response(output, &response).await?;
    Ok(request)
}

/// Entry point of the `sandbox-worker` subcommand.
///
/// Reads the request from stdin and writes the response to stdout. On
/// SIGTERM the execution is abandoned and its containers are removed.
pub async fn run_worker(sandbox: DockerSandbox) -> crate::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let terminated = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let on_terminate = {
        let terminated = terminated.clone();
        async move {
            sigterm.recv().await;
            terminated.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    };

    let request = serve_worker_request(
        &sandbox,
        tokio::io::stdin(),
        tokio::io::stdout(),
        on_terminate,
    )
    .await?;

    if terminated.load(std::sync::atomic::Ordering::SeqCst) {
        sandbox.remove_task_containers(&request.task_id).await?;
    }
    Ok(())
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Worker executable
    pub program: PathBuf,
    /// Arguments passed to the worker
    pub args: Vec<String>,
    /// Maximum concurrent workers
    pub workers: usize,
    /// Extra time a worker gets beyond the request timeout
    pub grace_period: Duration,
    /// Time between SIGTERM and SIGKILL
    pub kill_timeout: Duration,
}

impl WorkerPoolConfig {
    /// Run workers as `<current executable> sandbox-worker`.
    pub fn current_exe(workers: usize) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec![WORKER_SUBCOMMAND.to_string()],
            workers,
            grace_period: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
        })
    }
}

/// Sandbox dispatching every execution to a worker process.
pub struct IsolatedSandbox {
    config: WorkerPoolConfig,
    permits: Arc<Semaphore>,
    cleanup: Option<DockerSandbox>,
}

impl IsolatedSandbox {
    /// Create a worker pool.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            config,
            permits,
            cleanup: None,
        }
    }

    /// Remove containers of killed workers through `docker`.
    pub fn with_cleanup(mut self, docker: DockerSandbox) -> Self {
        self.cleanup = Some(docker);
        self
    }

    /// Number of idle worker slots.
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    fn spawn_worker(&self) -> Result<Child> {
        let child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    /// SIGTERM the worker, then SIGKILL it if it does not exit in time.
    async fn stop_worker(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!(pid = pid, "Sent SIGTERM to worker"),
                Err(nix::errno::Errno::ESRCH) => debug!(pid = pid, "Worker already exited"),
                Err(e) => warn!(pid = pid, error = %e, "Failed to send SIGTERM to worker"),
            }
            if let Ok(Ok(status)) =
                tokio::time::timeout(self.config.kill_timeout, child.wait()).await
            {
                debug!(pid = pid, status = %status, "Worker exited after SIGTERM");
                return;
            }
        }

        if let Err(e) = child.kill().await {
            error!(error = %e, "Failed to kill worker");
        }
    }
}

#[async_trait]
impl Sandbox for IsolatedSandbox {
    fn sandbox_type(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<FunctionOutput> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SandboxError::Worker("worker pool closed".to_string()))?;

        let mut child = self.spawn_worker()?;
        debug!(task_id = %request.task_id, pid = ?child.id(), "Worker spawned");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Worker("worker stdin unavailable".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Worker("worker stdout unavailable".to_string()))?;

        stdin.write_all(&serde_json::to_vec(request)?).await?;
        drop(stdin);

        let deadline = request.timeout + self.config.grace_period;
        let exchange = async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            let status = child.wait().await?;
            Ok::<_, SandboxError>((buf, status))
        };

        let exchanged = tokio::time::timeout(deadline, exchange).await;
        match exchanged {
            Ok(Ok((buf, status))) => {
                if buf.iter().all(u8::is_ascii_whitespace) {
                    return Err(SandboxError::Worker(format!(
                        "worker exited with {} without a response",
                        status
                    )));
                }
                let response: WorkerResponse = serde_json::from_slice(&buf)?;
                response.into_result(request.timeout)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    task_id = %request.task_id,
                    deadline_secs = deadline.as_secs(),
                    "Worker exceeded its deadline, stopping it"
                );
                self.stop_worker(&mut child).await;
                if let Some(docker) = &self.cleanup
                    && let Err(e) = docker.remove_task_containers(&request.task_id).await
                {
                    warn!(task_id = %request.task_id, error = %e, "Failed to remove worker containers");
                }
                Err(SandboxError::Timeout(request.timeout))
            }
        }
    }
}
