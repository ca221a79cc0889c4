// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test harness: orchestrator instances on one in-memory broker.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use nimbus_broker::memory::{ConsumerStats, MemoryBroker, MemoryCounterStore};
use nimbus_executor::messages::Completion;
use nimbus_executor::orchestrator::OrchestratorConfig;
use nimbus_executor::runtime::OrchestratorRuntime;
use nimbus_executor::sandbox::MockSandbox;

pub const STREAM: &str = "FUNCTIONS";

/// A broker and counter store shared by every instance of a test.
pub struct Cluster {
    pub broker: MemoryBroker,
    pub counters: Arc<MemoryCounterStore>,
}

/// One running orchestrator instance.
pub struct Instance {
    pub runtime: OrchestratorRuntime,
    pub sandbox: Arc<MockSandbox>,
}

/// Settings used by tests: short timeouts so failures surface quickly.
pub fn test_config(host_id: &str) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(host_id);
    config.task_timeout = Duration::from_secs(5);
    config.execution_timeout = Duration::from_secs(2);
    config.heartbeat_interval = Duration::from_secs(1);
    config
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
            counters: Arc::new(MemoryCounterStore::new()),
        }
    }

    /// Start an instance with default test settings.
    pub async fn start(&self, host_id: &str, sandbox: MockSandbox) -> Instance {
        self.start_with(test_config(host_id), sandbox, 4).await
    }

    /// Start an instance and wait until its consumers are running.
    pub async fn start_with(
        &self,
        config: OrchestratorConfig,
        sandbox: MockSandbox,
        max_in_flight: usize,
    ) -> Instance {
        let sandbox = Arc::new(sandbox);
        let runtime = OrchestratorRuntime::builder()
            .broker(Arc::new(self.broker.clone()))
            .admin(Arc::new(self.broker.clone()))
            .counters(self.counters.clone())
            .sandbox(sandbox.clone())
            .config(config)
            .max_in_flight(max_in_flight)
            .reconnect_delay(Duration::from_millis(20))
            .provision_retry_delay(Duration::from_millis(20))
            .drain_timeout(Duration::from_millis(200))
            .build()
            .expect("runtime config")
            .start()
            .await
            .expect("runtime start");

        tokio::time::timeout(Duration::from_secs(2), runtime.readiness().wait())
            .await
            .expect("runtime should become ready");

        Instance { runtime, sandbox }
    }

    /// Completions stored for `host`, decoded.
    pub async fn completions_for(&self, host: &str) -> Vec<Completion> {
        self.broker
            .messages(STREAM, &format!("Completed.{}", host))
            .await
            .into_iter()
            .map(|(_, payload)| serde_json::from_slice(&payload).expect("completion payload"))
            .collect()
    }

    /// Number of stored activations.
    pub async fn activation_count(&self) -> usize {
        self.broker.messages(STREAM, "Activations").await.len()
    }

    /// Counters of the shared activation consumer.
    pub async fn activation_stats(&self) -> ConsumerStats {
        self.broker
            .consumer_stats(STREAM, "ACTIVATE")
            .await
            .expect("activation consumer")
    }

    /// Counters of the completion consumer of `host`.
    pub async fn completion_stats(&self, host: &str) -> ConsumerStats {
        self.broker
            .consumer_stats(STREAM, &format!("COMPLETE-{}", host))
            .await
            .expect("completion consumer")
    }
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
