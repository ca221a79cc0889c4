// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandbox trait definitions.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::messages::FunctionOutput;

/// Errors from sandbox backends.
///
/// These are infrastructure failures; a function exiting with a non-zero
/// status is reported as a normal [`FunctionOutput`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SandboxError {
    /// The image could not be pulled.
    #[error("Failed to pull image {image}: {message}")]
    ImagePull {
        /// Image reference.
        image: String,
        /// Error reported by the container runtime.
        message: String,
    },

    /// The image metadata could not be read.
    #[error("Failed to inspect image {image}: {message}")]
    ImageInspect {
        /// Image reference.
        image: String,
        /// Error reported by the container runtime.
        message: String,
    },

    /// The container could not be created.
    #[error("Failed to create container: {0}")]
    ContainerCreate(String),

    /// The container could not be started.
    #[error("Failed to start container: {0}")]
    ContainerStart(String),

    /// Waiting for the container or reading its logs failed.
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// Execution exceeded its wall-clock limit.
    #[error("Execution timeout after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The isolated worker process failed.
    #[error("Sandbox worker failed: {0}")]
    Worker(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// One container run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Task the run belongs to; used to label the container.
    pub task_id: Uuid,
    /// Image reference.
    pub image: String,
    /// Arguments appended to the image's default command.
    pub parameters: Vec<String>,
    /// Wall-clock limit.
    pub timeout: Duration,
}

/// Trait for sandbox backends.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Short name of the backend, for logs.
    fn sandbox_type(&self) -> &'static str;

    /// Run the image to completion and return its output.
    ///
    /// Every container created for the request is removed before this
    /// returns, whatever the outcome.
    async fn execute(&self, request: &ExecutionRequest) -> Result<FunctionOutput>;
}
