// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process broker and counter store.
//!
//! Implements the same delivery contract as JetStream for a single process:
//! subject-filtered durable consumers with explicit acknowledgement, bounded
//! redelivery on nak, and competing consumption when several tasks consume
//! the same durable consumer. Used by tests and single-node setups.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::message::{Acknowledger, Delivery, DeliveryInfo};
use crate::subject;
use crate::traits::{
    BrokerAdmin, BrokerClient, CounterStore, DeliveryStream, DurableConsumerConfig, PublishAck,
};

/// Delivery counters of one durable consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries handed out, redeliveries included.
    pub delivered: u64,
    /// Messages acknowledged.
    pub acked: u64,
    /// Negative acknowledgements received.
    pub naked: u64,
    /// Progress signals received.
    pub in_progress: u64,
    /// Messages dropped after reaching `max_deliver`.
    pub terminated: u64,
    /// Messages delivered but not yet acknowledged.
    pub pending: usize,
}

#[derive(Debug)]
struct StoredMessage {
    subject: String,
    payload: Bytes,
}

#[derive(Debug)]
struct ConsumerState {
    config: DurableConsumerConfig,
    /// Next stream sequence to look at for first deliveries.
    cursor: u64,
    /// Delivery count of every unacknowledged message.
    in_flight: HashMap<u64, u64>,
    redeliver: VecDeque<u64>,
    stats: ConsumerStats,
}

impl ConsumerState {
    fn allows_redelivery(&self, delivered: u64) -> bool {
        self.config.max_deliver <= 0 || delivered < self.config.max_deliver as u64
    }
}

#[derive(Debug, Default)]
struct StreamState {
    subjects: Vec<String>,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    consumers: HashMap<String, ConsumerState>,
}

impl StreamState {
    fn captures(&self, subject_name: &str) -> bool {
        self.subjects
            .iter()
            .any(|pattern| subject::matches(pattern, subject_name))
    }

    /// Pick the next message for `consumer`: redeliveries first, then new messages.
    fn take_next(&mut self, consumer: &str) -> Option<(u64, String, Bytes, u64)> {
        let Self {
            messages,
            consumers,
            last_sequence,
            ..
        } = self;
        let state = consumers.get_mut(consumer)?;

        while let Some(sequence) = state.redeliver.pop_front() {
            let Some(message) = messages.get(&sequence) else {
                // Purged while waiting for redelivery.
                state.in_flight.remove(&sequence);
                continue;
            };
            let delivered = state.in_flight.entry(sequence).or_insert(0);
            *delivered += 1;
            let delivered = *delivered;
            state.stats.delivered += 1;
            return Some((
                sequence,
                message.subject.clone(),
                message.payload.clone(),
                delivered,
            ));
        }

        let filter = state.config.filter_subject.clone();
        let next = messages.range(state.cursor..).find(|(_, message)| {
            filter
                .as_deref()
                .is_none_or(|pattern| subject::matches(pattern, &message.subject))
        });

        match next {
            Some((&sequence, message)) => {
                state.cursor = sequence + 1;
                state.in_flight.insert(sequence, 1);
                state.stats.delivered += 1;
                Some((sequence, message.subject.clone(), message.payload.clone(), 1))
            }
            None => {
                state.cursor = state.cursor.max(*last_sequence + 1);
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    streams: Mutex<HashMap<String, StreamState>>,
    notify: Notify,
    fail_publishes: AtomicBool,
}

impl Inner {
    async fn try_next(
        self: &Arc<Self>,
        stream: &str,
        consumer: &str,
    ) -> Result<Option<Delivery>> {
        let mut streams = self.streams.lock().await;
        let stream_state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        if !stream_state.consumers.contains_key(consumer) {
            return Err(BrokerError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            });
        }

        Ok(stream_state
            .take_next(consumer)
            .map(|(sequence, subject_name, payload, delivered)| {
                let acker = MemoryAck {
                    inner: self.clone(),
                    stream: stream.to_string(),
                    consumer: consumer.to_string(),
                    sequence,
                    settled: AtomicBool::new(false),
                };
                Delivery::new(
                    subject_name,
                    payload,
                    DeliveryInfo {
                        delivered,
                        stream_sequence: sequence,
                    },
                    Arc::new(acker),
                )
            }))
    }

    async fn next_delivery(self: &Arc<Self>, stream: &str, consumer: &str) -> Result<Delivery> {
        loop {
            // Register interest before checking so a concurrent publish is not missed.
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_next(stream, consumer).await? {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn with_consumer<T>(
        &self,
        stream: &str,
        consumer: &str,
        f: impl FnOnce(&mut ConsumerState) -> T,
    ) -> Result<T> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .and_then(|s| s.consumers.get_mut(consumer))
            .ok_or_else(|| BrokerError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            })?;
        Ok(f(state))
    }
}

/// Acknowledger for a message handed out by [`MemoryBroker`].
struct MemoryAck {
    inner: Arc<Inner>,
    stream: String,
    consumer: String,
    sequence: u64,
    /// Set once the message was acked or naked; later calls are no-ops.
    settled: AtomicBool,
}

#[async_trait]
impl Acknowledger for MemoryAck {
    async fn ack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sequence = self.sequence;
        self.inner
            .with_consumer(&self.stream, &self.consumer, |state| {
                if state.in_flight.remove(&sequence).is_some() {
                    state.stats.acked += 1;
                }
            })
            .await
    }

    async fn nak(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sequence = self.sequence;
        self.inner
            .with_consumer(&self.stream, &self.consumer, |state| {
                state.stats.naked += 1;
                let Some(&delivered) = state.in_flight.get(&sequence) else {
                    return;
                };
                if state.allows_redelivery(delivered) {
                    state.redeliver.push_back(sequence);
                } else {
                    state.in_flight.remove(&sequence);
                    state.stats.terminated += 1;
                    debug!(sequence, delivered, "Message reached max deliveries");
                }
            })
            .await?;
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn in_progress(&self) -> Result<()> {
        self.inner
            .with_consumer(&self.stream, &self.consumer, |state| {
                state.stats.in_progress += 1;
            })
            .await
    }
}

/// In-process broker implementing [`BrokerClient`] and [`BrokerAdmin`].
///
/// Cheap to clone; clones share the same streams, so several orchestrators
/// built on clones behave like instances connected to one server.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following publish fail (or succeed again).
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Payloads currently stored whose subject matches `pattern`, in order.
    pub async fn messages(&self, stream: &str, pattern: &str) -> Vec<(String, Bytes)> {
        let streams = self.inner.streams.lock().await;
        streams
            .get(stream)
            .map(|s| {
                s.messages
                    .values()
                    .filter(|m| subject::matches(pattern, &m.subject))
                    .map(|m| (m.subject.clone(), m.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delivery counters of a consumer.
    pub async fn consumer_stats(&self, stream: &str, consumer: &str) -> Option<ConsumerStats> {
        let streams = self.inner.streams.lock().await;
        let state = streams.get(stream)?.consumers.get(consumer)?;
        Some(ConsumerStats {
            pending: state.in_flight.len(),
            ..state.stats.clone()
        })
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn publish(&self, subject_name: &str, payload: Bytes) -> Result<PublishAck> {
        if self.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish {
                subject: subject_name.to_string(),
                message: "publishing disabled".to_string(),
            });
        }

        let ack = {
            let mut streams = self.inner.streams.lock().await;
            let (name, stream_state) = streams
                .iter_mut()
                .find(|(_, s)| s.captures(subject_name))
                .ok_or_else(|| BrokerError::Publish {
                    subject: subject_name.to_string(),
                    message: "no stream captures this subject".to_string(),
                })?;
            stream_state.last_sequence += 1;
            let sequence = stream_state.last_sequence;
            stream_state.messages.insert(
                sequence,
                StoredMessage {
                    subject: subject_name.to_string(),
                    payload,
                },
            );
            PublishAck {
                stream: name.clone(),
                sequence,
                duplicate: false,
            }
        };

        self.inner.notify.notify_waiters();
        Ok(ack)
    }

    async fn consume(&self, stream: &str, consumer: &str) -> Result<DeliveryStream> {
        self.inner
            .with_consumer(stream, consumer, |_| ())
            .await?;

        let state = (
            self.inner.clone(),
            stream.to_string(),
            consumer.to_string(),
            false,
        );
        let deliveries = futures::stream::unfold(
            state,
            |(inner, stream, consumer, failed)| async move {
                if failed {
                    return None;
                }
                let item = inner.next_delivery(&stream, &consumer).await;
                let failed = item.is_err();
                Some((item, (inner, stream, consumer, failed)))
            },
        );
        Ok(Box::pin(deliveries))
    }

    async fn next_message(
        &self,
        stream: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>> {
        match tokio::time::timeout(wait, self.inner.next_delivery(stream, consumer)).await {
            Ok(delivery) => {
                let delivery = delivery?;
                delivery.ack().await?;
                Ok(Some(delivery))
            }
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl BrokerAdmin for MemoryBroker {
    async fn create_stream(&self, name: &str, subjects: &[String]) -> Result<()> {
        let mut streams = self.inner.streams.lock().await;
        streams.entry(name.to_string()).or_insert_with(|| StreamState {
            subjects: subjects.to_vec(),
            ..Default::default()
        });
        Ok(())
    }

    async fn create_durable_consumer(
        &self,
        stream: &str,
        config: &DurableConsumerConfig,
    ) -> Result<()> {
        let mut streams = self.inner.streams.lock().await;
        let stream_state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        stream_state
            .consumers
            .entry(config.name.clone())
            .or_insert_with(|| ConsumerState {
                config: config.clone(),
                cursor: 1,
                in_flight: HashMap::new(),
                redeliver: VecDeque::new(),
                stats: ConsumerStats::default(),
            });
        Ok(())
    }

    async fn purge_stream(&self, stream: &str) -> Result<u64> {
        let mut streams = self.inner.streams.lock().await;
        let stream_state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        let purged = stream_state.messages.len() as u64;
        stream_state.messages.clear();
        Ok(purged)
    }

    async fn list_consumers(&self, stream: &str) -> Result<Vec<String>> {
        let streams = self.inner.streams.lock().await;
        let stream_state = streams
            .get(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        let mut names: Vec<String> = stream_state.consumers.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// In-process [`CounterStore`].
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    values: Mutex<HashMap<String, i64>>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.values.lock().await.get(key).copied())
    }

    async fn put(&self, key: &str, value: i64) -> Result<()> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().await.remove(key);
        Ok(())
    }

    async fn purge(&self, key: &str) -> Result<()> {
        self.delete(key).await
    }

    async fn fetch_update(
        &self,
        key: &str,
        f: &(dyn Fn(i64) -> Option<i64> + Send + Sync),
    ) -> Result<std::result::Result<i64, i64>> {
        let mut values = self.values.lock().await;
        let current = values.get(key).copied().unwrap_or(0);
        match f(current) {
            Some(next) => {
                values.insert(key.to_string(), next);
                Ok(Ok(current))
            }
            None => Ok(Err(current)),
        }
    }
}
