// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for nimbus-executor.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Reasons a queued task did not produce a result.
///
/// A function that runs and exits with a non-zero status is *not* an error:
/// it is returned as a [`FunctionOutput`](crate::messages::FunctionOutput)
/// with `exit_status != 0`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// The user already has the maximum number of activations in flight.
    #[error("Concurrency limit exceeded for {username}: {active} of {limit} activations in flight")]
    ConcurrencyLimitExceeded {
        /// User that was rejected.
        username: String,
        /// Activations in flight when the request was rejected.
        active: i64,
        /// Configured maximum.
        limit: i64,
    },

    /// The activation could not be published.
    #[error("Failed to publish activation: {0}")]
    PublishFailure(String),

    /// No completion arrived in time.
    #[error("Task {task_id} timed out after {}s", .after.as_secs())]
    Timeout {
        /// Correlation id of the abandoned task.
        task_id: Uuid,
        /// How long the caller waited.
        after: Duration,
    },

    /// Every execution attempt failed; carries the last failure text.
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// The counter store could not be read or updated.
    #[error("Counter store error: {0}")]
    Counter(#[source] nimbus_broker::BrokerError),

    /// The orchestrator shut down while the task was waiting.
    #[error("Orchestrator is shutting down")]
    Shutdown,

    /// No function with this name is registered for the user.
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Executor errors surfaced at the process boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Sandbox execution failed.
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] crate::sandbox::SandboxError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using the executor Error.
pub type Result<T> = std::result::Result<T, Error>;
