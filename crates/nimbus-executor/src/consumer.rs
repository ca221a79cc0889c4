// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background workers consuming the activation and completion consumers.
//!
//! Each worker waits for the [`ReadinessGate`], then pulls deliveries from
//! its durable consumer until shutdown. A lost consumer stream is reopened
//! after `reconnect_delay`.
//!
//! Activations are executed concurrently, bounded by `max_in_flight`.
//! Completions are cheap and handled inline.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use nimbus_broker::{BrokerClient, DeliveryStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::orchestrator::TaskOrchestrator;
use crate::readiness::ReadinessGate;

/// Which consumer a worker drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    /// The shared activation consumer.
    Activations,
    /// This instance's completion consumer.
    Completions,
}

impl ConsumerKind {
    fn as_str(&self) -> &'static str {
        match self {
            ConsumerKind::Activations => "activations",
            ConsumerKind::Completions => "completions",
        }
    }
}

/// Configuration for a consumer worker.
#[derive(Debug, Clone)]
pub struct ConsumerWorkerConfig {
    /// Delay before reopening a consumer stream that failed or ended.
    pub reconnect_delay: Duration,
    /// Maximum activations executing at once on this instance.
    pub max_in_flight: usize,
    /// How long shutdown waits for executing activations before aborting them.
    pub drain_timeout: Duration,
}

impl Default for ConsumerWorkerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(2),
            max_in_flight: 4,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

enum LoopExit {
    Shutdown,
    Disconnected,
}

/// Background worker for one durable consumer.
pub struct ConsumerWorker {
    kind: ConsumerKind,
    orchestrator: Arc<TaskOrchestrator>,
    broker: Arc<dyn BrokerClient>,
    readiness: Arc<ReadinessGate>,
    config: ConsumerWorkerConfig,
    permits: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl ConsumerWorker {
    /// Create a new worker.
    pub fn new(
        kind: ConsumerKind,
        orchestrator: Arc<TaskOrchestrator>,
        broker: Arc<dyn BrokerClient>,
        readiness: Arc<ReadinessGate>,
        config: ConsumerWorkerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            kind,
            orchestrator,
            broker,
            readiness,
            config,
            permits,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn consumer_name(&self) -> String {
        let topology = &self.orchestrator.config().topology;
        match self.kind {
            ConsumerKind::Activations => topology.activate_consumer.clone(),
            ConsumerKind::Completions => topology.completion_consumer(),
        }
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        let stream = self.orchestrator.config().topology.stream.clone();
        let consumer = self.consumer_name();

        tokio::select! {
            biased;

            _ = self.shutdown.notified() => {
                info!(kind = self.kind.as_str(), "Consumer worker stopped before broker was ready");
                return;
            }

            _ = self.readiness.wait() => {}
        }

        info!(
            kind = self.kind.as_str(),
            stream = %stream,
            consumer = %consumer,
            "Consumer worker started"
        );

        let mut tasks = JoinSet::new();

        loop {
            let deliveries = tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,

                result = self.broker.consume(&stream, &consumer) => result,
            };

            let exit = match deliveries {
                Ok(deliveries) => match self.kind {
                    ConsumerKind::Activations => {
                        self.consume_activations(deliveries, &mut tasks).await
                    }
                    ConsumerKind::Completions => self.consume_completions(deliveries).await,
                },
                Err(e) => {
                    error!(
                        kind = self.kind.as_str(),
                        consumer = %consumer,
                        error = %e,
                        "Failed to open consumer"
                    );
                    LoopExit::Disconnected
                }
            };

            if let LoopExit::Shutdown = exit {
                break;
            }

            warn!(
                kind = self.kind.as_str(),
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "Consumer stream ended, reopening"
            );
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,

                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        info!(kind = self.kind.as_str(), "Consumer worker received shutdown signal");
        self.drain(&mut tasks).await;
        info!(kind = self.kind.as_str(), "Consumer worker stopped");
    }

    async fn consume_activations(
        &self,
        mut deliveries: DeliveryStream,
        tasks: &mut JoinSet<()>,
    ) -> LoopExit {
        loop {
            // Take a slot first so no message is held while all slots are busy.
            let permit = tokio::select! {
                biased;

                _ = self.shutdown.notified() => return LoopExit::Shutdown,

                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return LoopExit::Shutdown,
                },
            };

            let next = tokio::select! {
                biased;

                _ = self.shutdown.notified() => return LoopExit::Shutdown,

                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let orchestrator = self.orchestrator.clone();
                    tasks.spawn(async move {
                        let outcome = orchestrator.handle_activation(delivery).await;
                        debug!(outcome = ?outcome, "Activation handled");
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Activation consumer failed");
                    return LoopExit::Disconnected;
                }
                None => return LoopExit::Disconnected,
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!("Activation task panicked: {}", e);
                }
            }
        }
    }

    async fn consume_completions(&self, mut deliveries: DeliveryStream) -> LoopExit {
        loop {
            let next = tokio::select! {
                biased;

                _ = self.shutdown.notified() => return LoopExit::Shutdown,

                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.orchestrator.handle_completion(delivery).await;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Completion consumer failed");
                    return LoopExit::Disconnected;
                }
                None => return LoopExit::Disconnected,
            }
        }
    }

    /// Wait for executing activations, aborting whatever is left after `drain_timeout`.
    ///
    /// Aborted activations are never acknowledged, so the broker redelivers them.
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(in_flight = tasks.len(), "Waiting for executing activations");

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!("Activation task panicked: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                aborted = tasks.len(),
                "Activations still executing after drain timeout, aborting"
            );
            tasks.shutdown().await;
        }
    }
}
