// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Broker - durable messaging and counters
//!
//! This crate provides the messaging substrate shared by all nimbus
//! instances:
//! - Publishing to subjects and consuming durable consumers as streams
//! - Idempotent provisioning of streams and durable consumers
//! - An integer counter store used for per-user concurrency accounting
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      nimbus-broker                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Traits: BrokerClient / BrokerAdmin / CounterStore          │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  jetstream + kv (async-nats) │  memory (in-process)         │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Delivery contract
//!
//! Every consumer uses explicit acknowledgement. A message that is
//! negative-acknowledged is redelivered until it has been delivered
//! `max_deliver` times; after that the broker stops delivering it.
//! [`DeliveryInfo::delivered`] tells the handler which attempt it is looking at.
//!
//! # Usage
//!
//! ```ignore
//! use nimbus_broker::{BrokerAdmin, BrokerClient, DurableConsumerConfig};
//! use nimbus_broker::jetstream::{JetStreamBroker, JetStreamConfig};
//!
//! let broker = JetStreamBroker::connect(&JetStreamConfig::default()).await?;
//! broker.create_stream("FUNCTIONS", &["Activations".into()]).await?;
//! broker
//!     .create_durable_consumer(
//!         "FUNCTIONS",
//!         &DurableConsumerConfig::new("ACTIVATE", 5).filtered("Activations"),
//!     )
//!     .await?;
//!
//! broker.publish("Activations", payload).await?;
//! let mut deliveries = broker.consume("FUNCTIONS", "ACTIVATE").await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     delivery.ack().await?;
//! }
//! ```

pub mod error;
pub mod jetstream;
pub mod kv;
pub mod memory;
pub mod message;
pub mod subject;
pub mod traits;

pub use error::{BrokerError, Result};
pub use message::{Acknowledger, Delivery, DeliveryInfo};
pub use traits::{
    BrokerAdmin, BrokerClient, CounterStore, DeliveryStream, DurableConsumerConfig, PublishAck,
};
