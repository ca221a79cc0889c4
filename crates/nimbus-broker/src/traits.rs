// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker and counter store interfaces.
//!
//! The executor only talks to these traits. [`crate::jetstream`] implements
//! them on top of NATS JetStream, [`crate::memory`] implements them in-process.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::Result;
use crate::message::Delivery;

/// Infinite stream of deliveries from one durable consumer.
///
/// The stream ends only when the underlying connection is lost; callers
/// restart consumption by calling [`BrokerClient::consume`] again.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Acknowledgement returned by the broker for a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream that stored the message.
    pub stream: String,
    /// Sequence assigned to the message.
    pub sequence: u64,
    /// Whether the broker recognised the message as a duplicate.
    pub duplicate: bool,
}

/// Configuration of a durable, explicitly acknowledged consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableConsumerConfig {
    /// Durable name of the consumer.
    pub name: String,
    /// Maximum number of deliveries of a single message.
    pub max_deliver: i64,
    /// Only messages whose subject matches this pattern are delivered.
    pub filter_subject: Option<String>,
}

impl DurableConsumerConfig {
    /// Consumer that sees every subject of the stream.
    pub fn new(name: impl Into<String>, max_deliver: i64) -> Self {
        Self {
            name: name.into(),
            max_deliver,
            filter_subject: None,
        }
    }

    /// Restrict the consumer to a single subject pattern.
    pub fn filtered(mut self, filter_subject: impl Into<String>) -> Self {
        self.filter_subject = Some(filter_subject.into());
        self
    }
}

/// Publishing and consuming messages.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish a payload to a subject and wait for the broker's acknowledgement.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PublishAck>;

    /// Start consuming a durable consumer as an infinite stream.
    async fn consume(&self, stream: &str, consumer: &str) -> Result<DeliveryStream>;

    /// Fetch a single message, acknowledge it and return it.
    ///
    /// Returns `None` when nothing arrives within `wait`.
    async fn next_message(
        &self,
        stream: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>>;

    /// Flush pending publishes and close the connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Stream and consumer provisioning. Every create operation is idempotent.
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Create a stream capturing `subjects`, or leave an existing one untouched.
    async fn create_stream(&self, name: &str, subjects: &[String]) -> Result<()>;

    /// Create a durable consumer on `stream`, or reuse an existing one.
    async fn create_durable_consumer(
        &self,
        stream: &str,
        config: &DurableConsumerConfig,
    ) -> Result<()>;

    /// Remove every message from the stream. The stream itself remains.
    ///
    /// Returns the number of purged messages.
    async fn purge_stream(&self, stream: &str) -> Result<u64>;

    /// Names of the consumers bound to a stream.
    async fn list_consumers(&self, stream: &str) -> Result<Vec<String>>;
}

/// Integer counters stored as decimal strings.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value, or `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Set the value unconditionally.
    async fn put(&self, key: &str, value: i64) -> Result<()>;

    /// Delete the key. A later `get` returns `None`.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete the key and erase its history.
    async fn purge(&self, key: &str) -> Result<()>;

    /// Atomically apply `f` to the current value (missing keys read as 0).
    ///
    /// Mirrors `AtomicI64::fetch_update`: if `f` returns `Some(new)`, the
    /// value is replaced and `Ok(Ok(previous))` is returned; if it returns
    /// `None`, nothing is written and `Ok(Err(previous))` is returned.
    async fn fetch_update(
        &self,
        key: &str,
        f: &(dyn Fn(i64) -> Option<i64> + Send + Sync),
    ) -> Result<std::result::Result<i64, i64>>;
}
