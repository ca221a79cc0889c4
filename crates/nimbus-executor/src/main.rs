// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Executor - Distributed Function Orchestrator
//!
//! `nimbus-executor serve` (the default) connects to NATS, provisions the
//! stream and consumers, and executes activations until ctrl-c.
//!
//! `nimbus-executor sandbox-worker` runs a single execution request read from
//! stdin. It is spawned by the process-isolated sandbox and not meant to be
//! invoked by hand.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use nimbus_broker::jetstream::JetStreamBroker;
use nimbus_executor::config::Config;
use nimbus_executor::runtime::OrchestratorRuntime;
use nimbus_executor::sandbox::isolated::run_worker;
use nimbus_executor::sandbox::{self, DockerSandbox};

#[derive(Parser)]
#[command(name = "nimbus-executor", version, about = "Distributed function orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator (default)
    Serve,
    /// Execute one request from stdin in a container
    #[command(hide = true)]
    SandboxWorker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::SandboxWorker => sandbox_worker().await,
    }
}

async fn sandbox_worker() -> anyhow::Result<()> {
    // stdout carries the response; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nimbus_executor=warn".into()),
        )
        .init();

    run_worker(DockerSandbox::from_env()).await?;
    Ok(())
}

async fn serve() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nimbus_executor=info,nimbus_broker=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        host_id = %config.host_id,
        nats_url = %config.nats_url,
        stream = %config.stream,
        isolation = ?config.isolation,
        "Starting Nimbus Executor"
    );

    let broker = Arc::new(JetStreamBroker::connect(&config.jetstream_config()).await?);
    let counters = Arc::new(broker.counter_store(&config.kv_bucket).await?);
    info!(bucket = %config.kv_bucket, "Counter store ready");

    let sandbox = sandbox::build(
        config.isolation,
        config.sandbox_workers,
        config.docker.clone(),
    )?;
    info!(
        sandbox_type = sandbox.sandbox_type(),
        workers = config.sandbox_workers,
        "Sandbox initialized"
    );

    let runtime = OrchestratorRuntime::builder()
        .broker(broker.clone())
        .admin(broker)
        .counters(counters)
        .sandbox(sandbox)
        .config(config.orchestrator_config())
        .max_in_flight(config.sandbox_workers)
        .build()?
        .start()
        .await?;

    info!(host_id = %config.host_id, "Executor ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Nimbus Executor shut down");

    Ok(())
}
