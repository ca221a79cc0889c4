// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for nimbus-executor.

use std::str::FromStr;
use std::time::Duration;

use nimbus_broker::jetstream::JetStreamConfig;
use nimbus_broker::subject;

use crate::orchestrator::OrchestratorConfig;
use crate::sandbox::docker::DockerConfig;
use crate::topology::Topology;

/// How sandbox executions are isolated from the orchestrator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxIsolation {
    /// Every execution runs in a `sandbox-worker` child process.
    Process,
    /// Executions run inside the orchestrator process.
    Inline,
}

impl FromStr for SandboxIsolation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(SandboxIsolation::Process),
            "inline" => Ok(SandboxIsolation::Inline),
            _ => Err(()),
        }
    }
}

/// Executor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL(s)
    pub nats_url: String,
    /// NATS username (empty for anonymous)
    pub nats_user: String,
    /// NATS password
    pub nats_password: String,
    /// Stable id of this instance, used in the completion subject
    pub host_id: String,
    /// Stream holding activations and completions
    pub stream: String,
    /// Shared activation consumer name
    pub activate_consumer: String,
    /// Base name of the per-host completion consumer
    pub complete_consumer: String,
    /// Key-value bucket for per-user activation counters
    pub kv_bucket: String,
    /// Maximum deliveries of one message
    pub max_deliver: i64,
    /// How long `queue()` waits for a completion
    pub task_timeout: Duration,
    /// Wall-clock limit of one container run
    pub execution_timeout: Duration,
    /// Maximum activations in flight per user
    pub max_concurrent_activations: i64,
    /// Period of progress signals while an activation executes
    pub heartbeat_interval: Duration,
    /// Sandbox isolation mode
    pub isolation: SandboxIsolation,
    /// Maximum concurrent executions on this instance
    pub sandbox_workers: usize,
    /// Container settings
    pub docker: DockerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host_id = std::env::var("NIMBUS_HOST_ID")
            .or_else(|_| std::env::var("ID"))
            .map_err(|_| ConfigError::Missing("NIMBUS_HOST_ID or ID"))?;
        if !subject::is_valid_token(&host_id) {
            return Err(ConfigError::Invalid {
                var: "NIMBUS_HOST_ID",
                value: host_id,
            });
        }

        let isolation = match std::env::var("NIMBUS_SANDBOX_ISOLATION") {
            Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: "NIMBUS_SANDBOX_ISOLATION",
                value,
            })?,
            Err(_) => SandboxIsolation::Process,
        };

        let sandbox_workers = parse_env("NIMBUS_SANDBOX_WORKERS", 4usize)?;
        if sandbox_workers == 0 {
            return Err(ConfigError::Invalid {
                var: "NIMBUS_SANDBOX_WORKERS",
                value: "0".to_string(),
            });
        }

        let heartbeat_secs = parse_env("NIMBUS_HEARTBEAT_INTERVAL_SECS", 10u64)?;
        if heartbeat_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "NIMBUS_HEARTBEAT_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            nats_url: env_or("NATS_URL", "nats://localhost:4222"),
            nats_user: env_or("NATS_USER", ""),
            nats_password: env_or("NATS_PASS", ""),
            host_id,
            stream: env_or("NIMBUS_STREAM", "FUNCTIONS"),
            activate_consumer: env_or("NIMBUS_ACTIVATE_CONSUMER", "ACTIVATE"),
            complete_consumer: env_or("NIMBUS_COMPLETE_CONSUMER", "COMPLETE"),
            kv_bucket: env_or("NIMBUS_KV_BUCKET", "activations"),
            max_deliver: parse_env("NIMBUS_MAX_DELIVER", 5i64)?,
            task_timeout: Duration::from_secs(parse_env("NIMBUS_TASK_TIMEOUT_SECS", 240u64)?),
            execution_timeout: Duration::from_secs(parse_env(
                "NIMBUS_EXECUTION_TIMEOUT_SECS",
                60u64,
            )?),
            max_concurrent_activations: parse_env("NIMBUS_MAX_CONCURRENT_ACTIVATIONS", 10i64)?,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            isolation,
            sandbox_workers,
            docker: DockerConfig::from_env(),
        })
    }

    /// Connection settings for the broker.
    pub fn jetstream_config(&self) -> JetStreamConfig {
        JetStreamConfig {
            servers: self.nats_url.clone(),
            user: self.nats_user.clone(),
            password: self.nats_password.clone(),
            connection_name: Some(format!("nimbus-{}", self.host_id)),
            ..Default::default()
        }
    }

    /// Stream, subjects and consumers used by this instance.
    pub fn topology(&self) -> Topology {
        Topology {
            stream: self.stream.clone(),
            activate_consumer: self.activate_consumer.clone(),
            complete_consumer: self.complete_consumer.clone(),
            host_id: self.host_id.clone(),
            max_deliver: self.max_deliver,
        }
    }

    /// Orchestrator settings.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            topology: self.topology(),
            task_timeout: self.task_timeout,
            execution_timeout: self.execution_timeout,
            max_concurrent_activations: self.max_concurrent_activations,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
