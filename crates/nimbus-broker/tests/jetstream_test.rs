// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JetStream integration tests.
//!
//! These start a `nats:2.10-alpine` container and need a Docker daemon.
//! They are skipped unless `NIMBUS_DOCKER_TESTS` is set.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use nimbus_broker::jetstream::{JetStreamBroker, JetStreamConfig};
use nimbus_broker::{BrokerAdmin, BrokerClient, CounterStore, DurableConsumerConfig};
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Skip the test if Docker-backed tests are not enabled.
macro_rules! skip_without_docker {
    () => {
        if std::env::var("NIMBUS_DOCKER_TESTS").is_err() {
            eprintln!("Skipping test: NIMBUS_DOCKER_TESTS not set");
            return;
        }
    };
}

async fn start_nats() -> (ContainerAsync<GenericImage>, JetStreamBroker) {
    let container = GenericImage::new("nats", "2.10-alpine")
        .with_exposed_port(4222.tcp())
        .with_wait_for(WaitFor::message_on_stderr("Server is ready"))
        .with_cmd(["-js"])
        .start()
        .await
        .expect("Failed to start nats container");

    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(4222.tcp())
        .await
        .expect("container port");

    let config = JetStreamConfig {
        servers: format!("nats://{}:{}", host, port),
        ..Default::default()
    };
    let broker = JetStreamBroker::connect(&config)
        .await
        .expect("Failed to connect to nats");
    (container, broker)
}

#[tokio::test]
async fn test_provisioning_is_idempotent() {
    skip_without_docker!();
    let (_container, broker) = start_nats().await;

    let subjects = vec!["Activations".to_string(), "Completed.*".to_string()];
    let consumer = DurableConsumerConfig::new("ACTIVATE", 5).filtered("Activations");

    for _ in 0..2 {
        broker.create_stream("FUNCTIONS", &subjects).await.unwrap();
        broker
            .create_durable_consumer("FUNCTIONS", &consumer)
            .await
            .unwrap();
    }

    assert_eq!(
        broker.list_consumers("FUNCTIONS").await.unwrap(),
        vec!["ACTIVATE".to_string()]
    );
}

#[tokio::test]
async fn test_nak_redelivers_with_increasing_count() {
    skip_without_docker!();
    let (_container, broker) = start_nats().await;

    broker
        .create_stream("FUNCTIONS", &["Activations".to_string()])
        .await
        .unwrap();
    broker
        .create_durable_consumer(
            "FUNCTIONS",
            &DurableConsumerConfig::new("ACTIVATE", 2).filtered("Activations"),
        )
        .await
        .unwrap();

    broker
        .publish("Activations", Bytes::from_static(b"{}"))
        .await
        .unwrap();

    let mut deliveries = broker.consume("FUNCTIONS", "ACTIVATE").await.unwrap();
    let first = deliveries.next().await.unwrap().unwrap();
    assert_eq!(first.info.delivered, 1);
    first.nak().await.unwrap();

    let second = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
        .await
        .expect("redelivery did not arrive")
        .unwrap()
        .unwrap();
    assert_eq!(second.info.delivered, 2);
    assert!(second.info.is_redelivery());
    second.ack().await.unwrap();
}

#[tokio::test]
async fn test_counter_store_roundtrip() {
    skip_without_docker!();
    let (_container, broker) = start_nats().await;
    let store = broker.counter_store("activations").await.unwrap();

    assert_eq!(store.get("alice.activations.active").await.unwrap(), None);

    let increment = |v: i64| Some(v + 1);
    store
        .fetch_update("alice.activations.active", &increment)
        .await
        .unwrap()
        .unwrap();
    store
        .fetch_update("alice.activations.active", &increment)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(store.get("alice.activations.active").await.unwrap(), Some(2));

    store.delete("alice.activations.active").await.unwrap();
    assert_eq!(store.get("alice.activations.active").await.unwrap(), None);

    // Updating over a delete marker starts again from zero.
    let previous = store
        .fetch_update("alice.activations.active", &increment)
        .await
        .unwrap();
    assert_eq!(previous, Ok(0));
}

#[tokio::test]
async fn test_concurrent_admissions_never_exceed_limit() {
    skip_without_docker!();
    let (_container, broker) = start_nats().await;
    let store = broker.counter_store("activations").await.unwrap();

    const WRITERS: usize = 8;
    const LIMIT: i64 = 3;

    let mut handles = Vec::new();
    for _ in 0..WRITERS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let admit = |v: i64| (v < LIMIT).then_some(v + 1);
            store.fetch_update("bob.activations.active", &admit).await
        }));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Ok(_) => admitted += 1,
            Err(active) => {
                assert_eq!(active, LIMIT);
                rejected += 1;
            }
        }
    }

    assert_eq!(admitted, LIMIT as usize);
    assert_eq!(rejected, WRITERS - LIMIT as usize);
    assert_eq!(store.get("bob.activations.active").await.unwrap(), Some(LIMIT));
}
