// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task orchestrator.
//!
//! Turns a blocking `queue()` call into an activation on the shared subject,
//! runs activations picked up by this instance in the sandbox, and routes
//! completions back to the waiting caller.
//!
//! # Task lifecycle
//!
//! ```text
//!             queue()
//!                │ admit (counter < limit) ──────────▶ ConcurrencyLimitExceeded
//!                ▼
//!             Queued ──publish fails──────────────────▶ PublishFailure
//!                │ some instance picks it up
//!                ▼
//!            Executing ──sandbox error, delivered < max──▶ nak ──▶ Queued
//!                │                    │
//!                │ ok                 └─ delivered >= max ──▶ Failed (failure completion)
//!                ▼
//!            Completed ──────────────▶ caller gets FunctionOutput
//!
//!   no completion within task_timeout ──────────────────▶ Timeout
//! ```

mod heartbeat;
pub mod limiter;
pub mod pending;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use nimbus_broker::{BrokerClient, CounterStore, Delivery};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::TaskError;
use crate::messages::{Activation, Completion, CompletionOutcome, FunctionOutput, Parameters};
use crate::sandbox::{ExecutionRequest, Sandbox};
use crate::topology::{ACTIVATION_SUBJECT, Topology};

use heartbeat::ProgressHeartbeat;
pub use limiter::{ActivationSlot, ConcurrencyLimiter};
pub use pending::PendingTasks;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Names of the stream, subjects and consumers.
    pub topology: Topology,
    /// How long `queue()` waits for a completion.
    pub task_timeout: Duration,
    /// Wall-clock limit of one sandbox run.
    pub execution_timeout: Duration,
    /// Maximum activations in flight per user.
    pub max_concurrent_activations: i64,
    /// Period of progress signals while an activation executes.
    pub heartbeat_interval: Duration,
}

impl OrchestratorConfig {
    /// Default settings for `host_id`.
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            topology: Topology::new(host_id),
            task_timeout: Duration::from_secs(240),
            execution_timeout: Duration::from_secs(60),
            max_concurrent_activations: 10,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// What happened to one activation delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// The function ran and a completion was published.
    Completed,
    /// The sandbox failed; the message was handed back for redelivery.
    Retrying,
    /// The sandbox failed on the last allowed delivery; a failure completion was published.
    Failed,
    /// The payload could not be decoded and was dropped.
    Discarded,
}

/// Coordinates queueing, execution and completion of tasks.
pub struct TaskOrchestrator {
    config: OrchestratorConfig,
    broker: Arc<dyn BrokerClient>,
    sandbox: Arc<dyn Sandbox>,
    limiter: ConcurrencyLimiter,
    pending: PendingTasks,
}

impl TaskOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        config: OrchestratorConfig,
        broker: Arc<dyn BrokerClient>,
        counters: Arc<dyn CounterStore>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        let limiter = ConcurrencyLimiter::new(counters, config.max_concurrent_activations);
        Self {
            config,
            broker,
            sandbox,
            limiter,
            pending: PendingTasks::new(),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Id of this instance.
    pub fn host_id(&self) -> &str {
        &self.config.topology.host_id
    }

    /// Tasks this instance is waiting for.
    pub fn pending(&self) -> &PendingTasks {
        &self.pending
    }

    /// The per-user limiter.
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// The sandbox used for activations.
    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    /// Run `image` with `parameters` on behalf of `username` and wait for the result.
    ///
    /// The activation may execute on any instance. A non-zero exit status is
    /// returned as a normal [`FunctionOutput`].
    #[instrument(skip(self, parameters))]
    pub async fn queue(
        &self,
        image: &str,
        parameters: impl Into<Parameters>,
        username: &str,
    ) -> Result<FunctionOutput, TaskError> {
        let slot = self.limiter.acquire(username).await?;

        let task_id = Uuid::new_v4();
        let (registration, completion) = self.pending.register(task_id);

        let activation = Activation {
            task_id,
            image: image.to_string(),
            parameters: parameters.into(),
            host: self.host_id().to_string(),
            submitted_at: Some(Utc::now()),
        };

        if let Err(e) = self.publish_activation(&activation).await {
            drop(registration);
            slot.release().await;
            return Err(e);
        }
        debug!(task_id = %task_id, "Activation published");

        let result = match tokio::time::timeout(self.config.task_timeout, completion).await {
            Ok(Ok(CompletionOutcome::Result(output))) => Ok(output),
            Ok(Ok(CompletionOutcome::Error(message))) => Err(TaskError::ExecutionFailure(message)),
            Ok(Err(_)) => Err(TaskError::Shutdown),
            Err(_) => {
                warn!(
                    task_id = %task_id,
                    timeout_secs = self.config.task_timeout.as_secs(),
                    "Task timed out waiting for completion"
                );
                Err(TaskError::Timeout {
                    task_id,
                    after: self.config.task_timeout,
                })
            }
        };

        drop(registration);
        slot.release().await;
        result
    }

    async fn publish_activation(&self, activation: &Activation) -> Result<(), TaskError> {
        let payload =
            serde_json::to_vec(activation).map_err(|e| TaskError::PublishFailure(e.to_string()))?;
        self.broker
            .publish(ACTIVATION_SUBJECT, Bytes::from(payload))
            .await
            .map_err(|e| {
                error!(task_id = %activation.task_id, error = %e, "Failed to publish activation");
                TaskError::PublishFailure(e.to_string())
            })?;
        Ok(())
    }

    /// Publish a completion. Failures are logged, not returned: the caller
    /// times out instead.
    async fn publish_completion(&self, completion: &Completion) {
        let subject = self.config.topology.completion_subject(&completion.host);
        let payload = match serde_json::to_vec(completion) {
            Ok(payload) => payload,
            Err(e) => {
                error!(task_id = %completion.task_id, error = %e, "Failed to encode completion");
                return;
            }
        };
        match self.broker.publish(&subject, Bytes::from(payload)).await {
            Ok(_) => debug!(task_id = %completion.task_id, subject = %subject, "Completion published"),
            Err(e) => error!(
                task_id = %completion.task_id,
                subject = %subject,
                error = %e,
                "Failed to publish completion"
            ),
        }
    }

    /// Handle one delivery from the activation consumer.
    ///
    /// The message is acknowledged after a successful run, negative-acknowledged
    /// after a failed run with deliveries left, and acknowledged together with
    /// a failure completion once the last delivery failed.
    pub async fn handle_activation(&self, delivery: Delivery) -> ActivationOutcome {
        let activation: Activation = match serde_json::from_slice(&delivery.payload) {
            Ok(activation) => activation,
            Err(e) => {
                warn!(
                    stream_sequence = delivery.info.stream_sequence,
                    error = %e,
                    "Dropping undecodable activation"
                );
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, "Failed to acknowledge activation");
                }
                return ActivationOutcome::Discarded;
            }
        };

        let delivered = delivery.info.delivered;
        info!(
            task_id = %activation.task_id,
            image = %activation.image,
            origin = %activation.host,
            delivered,
            "Executing activation"
        );

        let request = ExecutionRequest {
            task_id: activation.task_id,
            image: activation.image.clone(),
            parameters: activation.parameters.clone().into_vec(),
            timeout: self.config.execution_timeout,
        };

        let heartbeat = ProgressHeartbeat::start(delivery.clone(), self.config.heartbeat_interval);
        let result = self.sandbox.execute(&request).await;
        heartbeat.stop();

        match result {
            Ok(output) => {
                info!(
                    task_id = %activation.task_id,
                    exit_status = output.exit_status,
                    "Activation executed"
                );
                self.publish_completion(&Completion::success(&activation, output))
                    .await;
                if let Err(e) = delivery.ack().await {
                    warn!(task_id = %activation.task_id, error = %e, "Failed to acknowledge activation");
                }
                ActivationOutcome::Completed
            }
            Err(e) if self.is_last_delivery(delivered) => {
                error!(
                    task_id = %activation.task_id,
                    delivered,
                    error = %e,
                    "Activation failed on its last delivery"
                );
                self.publish_completion(&Completion::failure(&activation, e.to_string()))
                    .await;
                if let Err(e) = delivery.ack().await {
                    warn!(task_id = %activation.task_id, error = %e, "Failed to acknowledge activation");
                }
                ActivationOutcome::Failed
            }
            Err(e) => {
                warn!(
                    task_id = %activation.task_id,
                    delivered,
                    max_deliver = self.config.topology.max_deliver,
                    error = %e,
                    "Activation failed, requesting redelivery"
                );
                if let Err(e) = delivery.nak().await {
                    warn!(task_id = %activation.task_id, error = %e, "Failed to nak activation");
                }
                ActivationOutcome::Retrying
            }
        }
    }

    fn is_last_delivery(&self, delivered: u64) -> bool {
        let max_deliver = self.config.topology.max_deliver;
        max_deliver > 0 && delivered >= max_deliver as u64
    }

    /// Handle one delivery from this instance's completion consumer.
    ///
    /// Returns whether a waiting caller was resolved.
    pub async fn handle_completion(&self, delivery: Delivery) -> bool {
        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Failed to acknowledge completion");
        }

        let completion: Completion = match serde_json::from_slice(&delivery.payload) {
            Ok(completion) => completion,
            Err(e) => {
                warn!(
                    stream_sequence = delivery.info.stream_sequence,
                    error = %e,
                    "Ignoring undecodable completion"
                );
                return false;
            }
        };

        let resolved = self.pending.resolve(&completion.task_id, completion.outcome);
        if resolved {
            debug!(task_id = %completion.task_id, "Completion delivered to caller");
        } else {
            debug!(task_id = %completion.task_id, "No caller waiting for completion");
        }
        resolved
    }

    /// Fail every waiting caller with [`TaskError::Shutdown`].
    pub fn abandon_pending(&self) -> usize {
        let abandoned = self.pending.clear();
        if abandoned > 0 {
            warn!(abandoned, "Abandoned waiting tasks");
        }
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_delivery() {
        let orchestrator = TaskOrchestrator::new(
            OrchestratorConfig::new("node-1"),
            Arc::new(nimbus_broker::memory::MemoryBroker::new()),
            Arc::new(nimbus_broker::memory::MemoryCounterStore::new()),
            Arc::new(crate::sandbox::MockSandbox::new()),
        );
        assert!(!orchestrator.is_last_delivery(4));
        assert!(orchestrator.is_last_delivery(5));
        assert!(orchestrator.is_last_delivery(6));
    }
}
