// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end orchestrator tests on the in-memory broker.
//!
//! Every test runs real runtimes (provisioning, consumer workers, completion
//! routing) with a [`MockSandbox`] standing in for Docker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nimbus_broker::{BrokerAdmin, BrokerClient};
use nimbus_executor::messages::{Completion, CompletionOutcome, FunctionOutput};
use nimbus_executor::sandbox::MockSandbox;
use nimbus_executor::service::{FunctionDefinition, FunctionService, InMemoryFunctionCatalog};
use nimbus_executor::TaskError;
use uuid::Uuid;

use common::{Cluster, test_config, wait_until};

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_queue_returns_function_output() {
    let cluster = Cluster::new();
    let node = cluster
        .start("node-1", MockSandbox::returning(FunctionOutput::new("hi", 0)))
        .await;

    let output = node
        .runtime
        .orchestrator()
        .queue("alpine:latest", vec!["echo", "hi"], "alice")
        .await
        .unwrap();

    assert_eq!(output, FunctionOutput::new("hi", 0));

    let requests = node.sandbox.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].image, "alpine:latest");
    assert_eq!(requests[0].parameters, vec!["echo", "hi"]);

    assert_eq!(
        node.runtime.orchestrator().limiter().active("alice").await.unwrap(),
        0
    );
    assert!(node.runtime.orchestrator().pending().is_empty());

    node.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_single_string_parameter() {
    let cluster = Cluster::new();
    let node = cluster.start("node-1", MockSandbox::new()).await;

    let output = node
        .runtime
        .orchestrator()
        .queue("alpine:latest", "date", "alice")
        .await
        .unwrap();

    assert_eq!(output.result, "date");
    node.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_non_zero_exit_is_returned_as_data() {
    let cluster = Cluster::new();
    let node = cluster
        .start("node-1", MockSandbox::returning(FunctionOutput::new("boom", 2)))
        .await;

    let output = node
        .runtime
        .orchestrator()
        .queue("alpine:latest", vec!["sh", "-c", "echo boom >&2; exit 2"], "alice")
        .await
        .unwrap();

    assert_eq!(output.result, "boom");
    assert_eq!(output.exit_status, 2);
    assert!(!output.succeeded());

    // A failing function is a successful orchestration: one run, no retries.
    assert_eq!(node.sandbox.call_count(), 1);
    let c = &cluster;
    assert!(
        wait_until(Duration::from_secs(2), || async move {
            c.activation_stats().await.acked == 1
        })
        .await
    );
    let stats = cluster.activation_stats().await;
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.naked, 0);

    node.runtime.shutdown().await.unwrap();
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_concurrency_limit_rejects_without_publishing() {
    let cluster = Cluster::new();
    let mut config = test_config("node-1");
    config.max_concurrent_activations = 1;
    let node = cluster
        .start_with(
            config,
            MockSandbox::new().with_delay(Duration::from_millis(300)),
            4,
        )
        .await;

    let orchestrator = node.runtime.orchestrator().clone();
    let first = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.queue("alpine:latest", "first", "alice").await }
    });

    assert!(
        wait_until(Duration::from_secs(2), || {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.limiter().active("alice").await.unwrap() == 1 }
        })
        .await
    );
    let c = &cluster;
    assert!(
        wait_until(Duration::from_secs(2), || async move {
            c.activation_count().await == 1
        })
        .await
    );

    let err = orchestrator
        .queue("alpine:latest", "second", "alice")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TaskError::ConcurrencyLimitExceeded {
            active: 1,
            limit: 1,
            ..
        }
    ));
    assert_eq!(cluster.activation_count().await, 1);

    // Other users have their own budget.
    orchestrator.queue("alpine:latest", "bob", "bob").await.unwrap();

    assert_eq!(first.await.unwrap().unwrap().result, "first");
    assert_eq!(orchestrator.limiter().active("alice").await.unwrap(), 0);

    node.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publish_failure_releases_slot() {
    let cluster = Cluster::new();
    let node = cluster.start("node-1", MockSandbox::new()).await;
    cluster.broker.fail_publishes(true);

    let err = node
        .runtime
        .orchestrator()
        .queue("alpine:latest", "hi", "alice")
        .await
        .unwrap_err();

    assert!(matches!(err, TaskError::PublishFailure(_)));
    assert_eq!(
        node.runtime.orchestrator().limiter().active("alice").await.unwrap(),
        0
    );
    assert!(node.runtime.orchestrator().pending().is_empty());
    assert_eq!(node.sandbox.call_count(), 0);

    cluster.broker.fail_publishes(false);
    node.runtime.shutdown().await.unwrap();
}

// ============================================================================
// Redelivery
// ============================================================================

#[tokio::test]
async fn test_succeeds_on_last_delivery() {
    let cluster = Cluster::new();
    let node = cluster.start("node-1", MockSandbox::failing_first(4)).await;

    let output = node
        .runtime
        .orchestrator()
        .queue("alpine:latest", vec!["echo", "hi"], "alice")
        .await
        .unwrap();
    assert_eq!(output, FunctionOutput::new("echo hi", 0));
    assert_eq!(node.sandbox.call_count(), 5);

    let completions = cluster.completions_for("node-1").await;
    assert_eq!(completions.len(), 1);
    assert!(matches!(completions[0].outcome, CompletionOutcome::Result(_)));

    // The activation is acknowledged right after its completion is published.
    let c = &cluster;
    assert!(
        wait_until(Duration::from_secs(2), || async move {
            c.activation_stats().await.acked == 1
        })
        .await
    );
    let stats = cluster.activation_stats().await;
    assert_eq!(stats.delivered, 5);
    assert_eq!(stats.naked, 4);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.pending, 0);

    node.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_deliveries_produce_one_failure_completion() {
    let cluster = Cluster::new();
    let node = cluster.start("node-1", MockSandbox::failing()).await;

    let err = node
        .runtime
        .orchestrator()
        .queue("alpine:latest", "hi", "alice")
        .await
        .unwrap_err();
    match err {
        TaskError::ExecutionFailure(message) => assert!(message.contains("Mock failure")),
        other => panic!("expected ExecutionFailure, got {:?}", other),
    }

    // Give a stray redelivery the chance to show up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.sandbox.call_count(), 5);

    let completions = cluster.completions_for("node-1").await;
    assert_eq!(completions.len(), 1);
    assert!(matches!(completions[0].outcome, CompletionOutcome::Error(_)));

    let stats = cluster.activation_stats().await;
    assert_eq!(stats.delivered, 5);
    assert_eq!(stats.naked, 4);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.pending, 0);

    node.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_activation_is_dropped() {
    let cluster = Cluster::new();
    let node = cluster.start("node-1", MockSandbox::new()).await;

    cluster
        .broker
        .publish("Activations", Bytes::from_static(b"not json"))
        .await
        .unwrap();

    let c = &cluster;
    assert!(
        wait_until(Duration::from_secs(2), || async move {
            c.activation_stats().await.acked == 1
        })
        .await
    );
    assert_eq!(cluster.activation_stats().await.naked, 0);
    assert_eq!(node.sandbox.call_count(), 0);

    node.runtime.shutdown().await.unwrap();
}

// ============================================================================
// Timeouts and late completions
// ============================================================================

#[tokio::test]
async fn test_task_timeout() {
    let cluster = Cluster::new();
    let mut config = test_config("node-1");
    config.task_timeout = Duration::from_millis(100);
    config.execution_timeout = Duration::from_millis(300);
    let node = cluster
        .start_with(config, MockSandbox::never_completing(), 4)
        .await;

    let err = node
        .runtime
        .orchestrator()
        .queue("alpine:latest", "sleep", "alice")
        .await
        .unwrap_err();

    match err {
        TaskError::Timeout { after, .. } => assert_eq!(after, Duration::from_millis(100)),
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert!(node.runtime.orchestrator().pending().is_empty());
    assert_eq!(
        node.runtime.orchestrator().limiter().active("alice").await.unwrap(),
        0
    );

    node.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_late_completion_is_acked_and_ignored() {
    let cluster = Cluster::new();
    let node = cluster.start("node-1", MockSandbox::new()).await;

    let late = Completion {
        task_id: Uuid::new_v4(),
        host: "node-1".to_string(),
        outcome: CompletionOutcome::Result(FunctionOutput::new("too late", 0)),
    };
    cluster
        .broker
        .publish(
            "Completed.node-1",
            Bytes::from(serde_json::to_vec(&late).unwrap()),
        )
        .await
        .unwrap();

    let c = &cluster;
    assert!(
        wait_until(Duration::from_secs(2), || async move {
            c.completion_stats("node-1").await.acked == 1
        })
        .await
    );
    let stats = cluster.completion_stats("node-1").await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.naked, 0);
    assert!(node.runtime.orchestrator().pending().is_empty());

    // The instance keeps working normally afterwards.
    let output = node
        .runtime
        .orchestrator()
        .queue("alpine:latest", "ok", "alice")
        .await
        .unwrap();
    assert_eq!(output.result, "ok");

    node.runtime.shutdown().await.unwrap();
}

// ============================================================================
// Heartbeats
// ============================================================================

#[tokio::test]
async fn test_progress_heartbeats_during_execution() {
    let cluster = Cluster::new();
    let mut config = test_config("node-1");
    config.heartbeat_interval = Duration::from_millis(20);
    let node = cluster
        .start_with(
            config,
            MockSandbox::new().with_delay(Duration::from_millis(200)),
            4,
        )
        .await;

    node.runtime
        .orchestrator()
        .queue("alpine:latest", "slow", "alice")
        .await
        .unwrap();

    assert!(cluster.activation_stats().await.in_progress >= 2);
    node.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_zero_heartbeat_interval_still_signals_progress() {
    let cluster = Cluster::new();
    let mut config = test_config("node-1");
    config.heartbeat_interval = Duration::ZERO;
    let node = cluster
        .start_with(
            config,
            MockSandbox::new().with_delay(Duration::from_millis(200)),
            4,
        )
        .await;

    node.runtime
        .orchestrator()
        .queue("alpine:latest", "slow", "alice")
        .await
        .unwrap();

    assert!(cluster.activation_stats().await.in_progress >= 1);
    node.runtime.shutdown().await.unwrap();
}

// ============================================================================
// Multiple instances
// ============================================================================

#[tokio::test]
async fn test_completions_are_routed_to_the_requesting_instance() {
    let cluster = Cluster::new();
    let a = cluster
        .start_with(
            test_config("node-a"),
            MockSandbox::new().with_delay(Duration::from_millis(50)),
            1,
        )
        .await;
    let b = cluster
        .start_with(
            test_config("node-b"),
            MockSandbox::new().with_delay(Duration::from_millis(50)),
            1,
        )
        .await;

    let mut handles = Vec::new();
    for i in 0..6 {
        let orchestrator = a.runtime.orchestrator().clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .queue("alpine:latest", format!("task-{}", i), &format!("user-{}", i))
                .await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let output = handle.await.unwrap().unwrap();
        assert_eq!(output.result, format!("task-{}", i));
    }

    // Work was shared, replies all went to the requester.
    assert_eq!(a.sandbox.call_count() + b.sandbox.call_count(), 6);
    assert!(b.sandbox.call_count() > 0);
    assert_eq!(cluster.completions_for("node-a").await.len(), 6);
    assert!(cluster.completions_for("node-b").await.is_empty());

    // Each instance has its own completion consumer.
    let names = cluster.broker.list_consumers(common::STREAM).await.unwrap();
    assert_eq!(names, vec!["ACTIVATE", "COMPLETE-node-a", "COMPLETE-node-b"]);

    a.runtime.shutdown().await.unwrap();
    b.runtime.shutdown().await.unwrap();
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_fails_waiting_callers() {
    let cluster = Cluster::new();
    let mut config = test_config("node-1");
    config.execution_timeout = Duration::from_secs(30);
    config.task_timeout = Duration::from_secs(30);
    let node = cluster
        .start_with(config, MockSandbox::never_completing(), 4)
        .await;

    let orchestrator = node.runtime.orchestrator().clone();
    let waiting = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.queue("alpine:latest", "forever", "alice").await }
    });
    assert!(wait_until(Duration::from_secs(2), || {
        let orchestrator = orchestrator.clone();
        async move { orchestrator.pending().len() == 1 }
    })
    .await);

    node.runtime.shutdown().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("caller should be released")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, TaskError::Shutdown));
}

// ============================================================================
// Function service
// ============================================================================

#[tokio::test]
async fn test_function_service_resolves_images() {
    let cluster = Cluster::new();
    let node = cluster.start("node-1", MockSandbox::new()).await;

    let catalog = Arc::new(InMemoryFunctionCatalog::new());
    catalog.register(FunctionDefinition {
        name: "greet".to_string(),
        image: "registry.local/alice/greet:1".to_string(),
        description: "Says hello".to_string(),
        owner: "alice".to_string(),
    });
    let service = FunctionService::new(catalog, node.runtime.orchestrator().clone());

    let output = service
        .execute_function("greet", vec!["hello", "world"], "alice")
        .await
        .unwrap();
    assert_eq!(output.result, "hello world");
    assert_eq!(
        node.sandbox.requests().await[0].image,
        "registry.local/alice/greet:1"
    );

    // Functions are private to their owner.
    let err = service
        .execute_function("greet", "hi", "bob")
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::FunctionNotFound(name) if name == "greet"));

    let err = service.execute_function("", "hi", "alice").await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidRequest(_)));

    assert_eq!(node.sandbox.call_count(), 1);
    node.runtime.shutdown().await.unwrap();
}
