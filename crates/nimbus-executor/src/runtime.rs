// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for nimbus-executor.
//!
//! [`OrchestratorRuntime`] wires a broker, a counter store and a sandbox into
//! a [`TaskOrchestrator`] and runs its background workers inside an existing
//! tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nimbus_broker::jetstream::{JetStreamBroker, JetStreamConfig};
//! use nimbus_executor::orchestrator::OrchestratorConfig;
//! use nimbus_executor::runtime::OrchestratorRuntime;
//! use nimbus_executor::sandbox::DockerSandbox;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = Arc::new(JetStreamBroker::connect(&JetStreamConfig::default()).await?);
//!     let counters = Arc::new(broker.counter_store("activations").await?);
//!
//!     let runtime = OrchestratorRuntime::builder()
//!         .broker(broker.clone())
//!         .admin(broker)
//!         .counters(counters)
//!         .sandbox(Arc::new(DockerSandbox::from_env()))
//!         .config(OrchestratorConfig::new("node-1"))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let output = runtime
//!         .orchestrator()
//!         .queue("alpine:latest", vec!["echo", "hi"], "alice")
//!         .await?;
//!     assert_eq!(output.result, "hi");
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use nimbus_broker::{BrokerAdmin, BrokerClient, CounterStore};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::consumer::{ConsumerKind, ConsumerWorker, ConsumerWorkerConfig};
use crate::orchestrator::{OrchestratorConfig, TaskOrchestrator};
use crate::readiness::ReadinessGate;
use crate::sandbox::Sandbox;
use crate::topology::Topology;

/// Builder for creating an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    broker: Option<Arc<dyn BrokerClient>>,
    admin: Option<Arc<dyn BrokerAdmin>>,
    counters: Option<Arc<dyn CounterStore>>,
    sandbox: Option<Arc<dyn Sandbox>>,
    config: Option<OrchestratorConfig>,
    consumer_config: ConsumerWorkerConfig,
    provision_retry_delay: Duration,
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            broker: None,
            admin: None,
            counters: None,
            sandbox: None,
            config: None,
            consumer_config: ConsumerWorkerConfig::default(),
            provision_retry_delay: Duration::from_secs(2),
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker client (required).
    pub fn broker(mut self, broker: Arc<dyn BrokerClient>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Set the broker admin used to provision the topology (required).
    pub fn admin(mut self, admin: Arc<dyn BrokerAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Set the counter store backing the per-user limit (required).
    pub fn counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Set the sandbox executing activations (required).
    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Set the orchestrator configuration (required).
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the delay before a failed consumer stream is reopened.
    ///
    /// Default: 2 seconds
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.consumer_config.reconnect_delay = delay;
        self
    }

    /// Set how many activations this instance executes at once.
    ///
    /// Default: 4
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.consumer_config.max_in_flight = max;
        self
    }

    /// Set how long shutdown waits for executing activations.
    ///
    /// Default: 30 seconds
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.consumer_config.drain_timeout = timeout;
        self
    }

    /// Set the delay between provisioning attempts.
    ///
    /// Default: 2 seconds
    pub fn provision_retry_delay(mut self, delay: Duration) -> Self {
        self.provision_retry_delay = delay;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let broker = self
            .broker
            .ok_or_else(|| anyhow::anyhow!("broker is required"))?;
        let admin = self
            .admin
            .ok_or_else(|| anyhow::anyhow!("admin is required"))?;
        let counters = self
            .counters
            .ok_or_else(|| anyhow::anyhow!("counters is required"))?;
        let sandbox = self
            .sandbox
            .ok_or_else(|| anyhow::anyhow!("sandbox is required"))?;
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;

        if config.max_concurrent_activations < 1 {
            anyhow::bail!("max_concurrent_activations must be at least 1");
        }

        Ok(OrchestratorRuntimeConfig {
            broker,
            admin,
            counters,
            sandbox,
            config,
            consumer_config: self.consumer_config,
            provision_retry_delay: self.provision_retry_delay,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    broker: Arc<dyn BrokerClient>,
    admin: Arc<dyn BrokerAdmin>,
    counters: Arc<dyn CounterStore>,
    sandbox: Arc<dyn Sandbox>,
    config: OrchestratorConfig,
    consumer_config: ConsumerWorkerConfig,
    provision_retry_delay: Duration,
}

impl OrchestratorRuntimeConfig {
    /// Start the runtime: provision the topology and spawn both consumer workers.
    ///
    /// Provisioning is retried in the background; the workers start consuming
    /// once it succeeds.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        let readiness = Arc::new(ReadinessGate::new());
        // The client was connected by whoever handed it to us.
        readiness.mark_client_ready();

        let topology = self.config.topology.clone();
        let orchestrator = Arc::new(TaskOrchestrator::new(
            self.config,
            self.broker.clone(),
            self.counters,
            self.sandbox,
        ));

        let provision_shutdown = Arc::new(Notify::new());
        let provision_handle = tokio::spawn(provision_with_retry(
            topology.clone(),
            self.admin,
            readiness.clone(),
            self.provision_retry_delay,
            provision_shutdown.clone(),
        ));

        let activation_worker = ConsumerWorker::new(
            ConsumerKind::Activations,
            orchestrator.clone(),
            self.broker.clone(),
            readiness.clone(),
            self.consumer_config.clone(),
        );
        let activation_shutdown = activation_worker.shutdown_handle();
        let activation_handle = tokio::spawn(async move {
            activation_worker.run().await;
        });

        let completion_worker = ConsumerWorker::new(
            ConsumerKind::Completions,
            orchestrator.clone(),
            self.broker.clone(),
            readiness.clone(),
            self.consumer_config,
        );
        let completion_shutdown = completion_worker.shutdown_handle();
        let completion_handle = tokio::spawn(async move {
            completion_worker.run().await;
        });

        info!(
            host_id = %topology.host_id,
            stream = %topology.stream,
            sandbox = orchestrator.sandbox().sandbox_type(),
            "OrchestratorRuntime started"
        );

        Ok(OrchestratorRuntime {
            orchestrator,
            broker: self.broker,
            readiness,
            provision_handle,
            activation_handle,
            completion_handle,
            provision_shutdown,
            activation_shutdown,
            completion_shutdown,
        })
    }
}

async fn provision_with_retry(
    topology: Topology,
    admin: Arc<dyn BrokerAdmin>,
    readiness: Arc<ReadinessGate>,
    retry_delay: Duration,
    shutdown: Arc<Notify>,
) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match topology.provision(admin.as_ref()).await {
            Ok(()) => {
                readiness.mark_admin_ready();
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Failed to provision broker topology, retrying");
            }
        }

        tokio::select! {
            biased;

            _ = shutdown.notified() => return,

            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}

/// A running orchestrator that can be embedded in an application.
///
/// The runtime manages:
/// - topology provisioning (retried until it succeeds)
/// - the activation consumer worker
/// - the completion consumer worker for this instance
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    orchestrator: Arc<TaskOrchestrator>,
    broker: Arc<dyn BrokerClient>,
    readiness: Arc<ReadinessGate>,
    provision_handle: JoinHandle<()>,
    activation_handle: JoinHandle<()>,
    completion_handle: JoinHandle<()>,
    provision_shutdown: Arc<Notify>,
    activation_shutdown: Arc<Notify>,
    completion_shutdown: Arc<Notify>,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// Get the orchestrator, e.g. to call [`TaskOrchestrator::queue`].
    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    /// Get the startup gate.
    pub fn readiness(&self) -> &Arc<ReadinessGate> {
        &self.readiness
    }

    /// Check if the consumer workers are still running.
    pub fn is_running(&self) -> bool {
        !self.activation_handle.is_finished() && !self.completion_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops both workers, fails every caller still waiting in `queue()`
    /// with a shutdown error, then flushes and closes the broker connection.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestratorRuntime shutting down...");

        self.provision_shutdown.notify_one();
        self.activation_shutdown.notify_one();
        self.completion_shutdown.notify_one();

        if let Err(e) = self.provision_handle.await {
            error!("Provisioning task panicked: {}", e);
        }
        if let Err(e) = self.activation_handle.await {
            error!("Activation worker task panicked: {}", e);
        }
        if let Err(e) = self.completion_handle.await {
            error!("Completion worker task panicked: {}", e);
        }

        self.orchestrator.abandon_pending();

        self.broker.close().await?;
        info!("OrchestratorRuntime shutdown complete");
        Ok(())
    }
}
