// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Executor - Distributed Function Orchestrator
//!
//! This crate runs user functions packaged as container images across a
//! fleet of identical instances. Any instance accepts a request, any
//! instance may execute it, and the result is routed back to the instance
//! holding the caller.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Request handlers                              │
//! │              FunctionService::execute_function(name, ...)             │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │ queue(image, parameters, username)
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                   nimbus-executor (this crate)                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌───────────┐  │
//! │  │ Concurrency  │  │   Pending    │  │  Activation  │  │ Completion│  │
//! │  │   Limiter    │  │    Tasks     │  │    Worker    │  │   Worker  │  │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └───────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │                                   │                ▲
//!          │ counters                Activations│    Completed.<host>
//!          ▼                                   ▼                │
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      NATS JetStream (nimbus-broker)                   │
//! │            stream FUNCTIONS, KV bucket for active counters            │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//!                    ┌──────────────────────────────┐
//!                    │  Sandbox (docker containers, │
//!                    │  optionally per worker proc) │
//!                    └──────────────────────────────┘
//! ```
//!
//! # Delivery semantics
//!
//! | Situation | Broker action | Caller sees |
//! |-----------|---------------|-------------|
//! | Function ran (any exit status) | ack, completion published | `FunctionOutput` |
//! | Sandbox error, deliveries left | nak, redelivered | nothing yet |
//! | Sandbox error on last delivery | ack, failure completion | `ExecutionFailure` |
//! | No completion in time | none | `Timeout` |
//! | User at limit | nothing published | `ConcurrencyLimitExceeded` |
//!
//! # Modules
//!
//! - [`config`]: Environment-based configuration
//! - [`orchestrator`]: Queueing, activation handling and completion routing
//! - [`consumer`]: Background consumer workers
//! - [`sandbox`]: Container execution backends
//! - [`runtime`]: Embeddable runtime with graceful shutdown
//! - [`service`]: Name-based facade over the orchestrator

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Background workers for the activation and completion consumers.
pub mod consumer;

/// Error types.
pub mod error;

/// Activation and completion payloads.
pub mod messages;

/// Task orchestration and the per-user concurrency limit.
pub mod orchestrator;

/// Startup gate for the consumer workers.
pub mod readiness;

/// Embeddable runtime.
pub mod runtime;

/// Sandbox backends.
pub mod sandbox;

/// Function catalog and the name-based service facade.
pub mod service;

/// Stream, subject and consumer names.
pub mod topology;

pub use config::Config;
pub use error::{Error, Result, TaskError};
pub use messages::{Activation, Completion, CompletionOutcome, FunctionOutput, Parameters};
pub use orchestrator::{OrchestratorConfig, TaskOrchestrator};
pub use runtime::OrchestratorRuntime;
