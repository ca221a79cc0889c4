// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! NATS JetStream implementation of the broker traits.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, AckKind, consumer, consumer::pull, stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, instrument};

use crate::error::{BrokerError, Result};
use crate::kv::JetStreamCounterStore;
use crate::message::{Acknowledger, Delivery, DeliveryInfo};
use crate::traits::{
    BrokerAdmin, BrokerClient, DeliveryStream, DurableConsumerConfig, PublishAck,
};

/// Connection settings for the NATS server.
#[derive(Debug, Clone)]
pub struct JetStreamConfig {
    /// Server URL(s), comma separated
    pub servers: String,
    /// Username; credentials are only sent when this is non-empty
    pub user: String,
    /// Password
    pub password: String,
    /// Connection name reported to the server
    pub connection_name: Option<String>,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            servers: "nats://localhost:4222".to_string(),
            user: String::new(),
            password: String::new(),
            connection_name: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// JetStream-backed broker client and admin.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct JetStreamBroker {
    client: async_nats::Client,
    context: jetstream::Context,
}

impl JetStreamBroker {
    /// Connect to the NATS server and open a JetStream context.
    #[instrument(skip(config), fields(servers = %config.servers))]
    pub async fn connect(config: &JetStreamConfig) -> Result<Self> {
        let mut options =
            async_nats::ConnectOptions::new().connection_timeout(config.connect_timeout);
        if !config.user.is_empty() {
            options = options.user_and_password(config.user.clone(), config.password.clone());
        }
        if let Some(name) = &config.connection_name {
            options = options.name(name);
        }

        let client = options
            .connect(config.servers.as_str())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        info!(servers = %config.servers, "Connected to NATS");

        let context = jetstream::new(client.clone());
        Ok(Self { client, context })
    }

    /// Open (or create) a key-value bucket used as a counter store.
    pub async fn counter_store(&self, bucket: &str) -> Result<JetStreamCounterStore> {
        JetStreamCounterStore::open(&self.context, bucket).await
    }

    async fn pull_consumer(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<consumer::Consumer<pull::Config>> {
        let stream_handle = self
            .context
            .get_stream(stream)
            .await
            .map_err(|_| BrokerError::StreamNotFound(stream.to_string()))?;
        stream_handle
            .get_consumer(consumer)
            .await
            .map_err(|_| BrokerError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            })
    }
}

/// Acknowledger wrapping a JetStream message.
struct JetStreamAck(jetstream::Message);

#[async_trait]
impl Acknowledger for JetStreamAck {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack()
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nak(&self) -> Result<()> {
        self.0
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn in_progress(&self) -> Result<()> {
        self.0
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

fn into_delivery(message: jetstream::Message) -> Result<Delivery> {
    let info = {
        let info = message
            .info()
            .map_err(|e| BrokerError::Consumer(format!("missing delivery info: {}", e)))?;
        DeliveryInfo {
            delivered: info.delivered.max(1) as u64,
            stream_sequence: info.stream_sequence,
        }
    };
    let subject = message.subject.to_string();
    let payload = message.payload.clone();
    Ok(Delivery::new(
        subject,
        payload,
        info,
        Arc::new(JetStreamAck(message)),
    ))
}

#[async_trait]
impl BrokerClient for JetStreamBroker {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PublishAck> {
        let publish_error = |e: &dyn std::fmt::Display| BrokerError::Publish {
            subject: subject.to_string(),
            message: e.to_string(),
        };

        let ack = self
            .context
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| publish_error(&e))?
            .await
            .map_err(|e| publish_error(&e))?;

        debug!(subject = %subject, sequence = ack.sequence, "Published message");

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn consume(&self, stream: &str, consumer: &str) -> Result<DeliveryStream> {
        let consumer_handle = self.pull_consumer(stream, consumer).await?;
        let messages = consumer_handle
            .messages()
            .await
            .map_err(|e| BrokerError::Consumer(e.to_string()))?;

        debug!(stream = %stream, consumer = %consumer, "Consuming messages");

        let deliveries = messages.map(|item| match item {
            Ok(message) => into_delivery(message),
            Err(e) => Err(BrokerError::Consumer(e.to_string())),
        });
        Ok(Box::pin(deliveries))
    }

    async fn next_message(
        &self,
        stream: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>> {
        let consumer_handle = self.pull_consumer(stream, consumer).await?;
        let mut batch = consumer_handle
            .fetch()
            .max_messages(1)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| BrokerError::Consumer(e.to_string()))?;

        match batch.next().await {
            Some(Ok(message)) => {
                let delivery = into_delivery(message)?;
                delivery.ack().await?;
                Ok(Some(delivery))
            }
            Some(Err(e)) => Err(BrokerError::Consumer(e.to_string())),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        info!("NATS connection flushed");
        Ok(())
    }
}

#[async_trait]
impl BrokerAdmin for JetStreamBroker {
    async fn create_stream(&self, name: &str, subjects: &[String]) -> Result<()> {
        self.context
            .get_or_create_stream(stream::Config {
                name: name.to_string(),
                subjects: subjects.to_vec(),
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Stream(e.to_string()))?;

        debug!(stream = %name, subjects = ?subjects, "Stream ready");
        Ok(())
    }

    async fn create_durable_consumer(
        &self,
        stream: &str,
        config: &DurableConsumerConfig,
    ) -> Result<()> {
        let stream_handle = self
            .context
            .get_stream(stream)
            .await
            .map_err(|_| BrokerError::StreamNotFound(stream.to_string()))?;

        stream_handle
            .get_or_create_consumer(
                &config.name,
                pull::Config {
                    durable_name: Some(config.name.clone()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    max_deliver: config.max_deliver,
                    filter_subject: config.filter_subject.clone().unwrap_or_default(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Consumer(e.to_string()))?;

        debug!(
            stream = %stream,
            consumer = %config.name,
            max_deliver = config.max_deliver,
            filter_subject = ?config.filter_subject,
            "Durable consumer ready"
        );
        Ok(())
    }

    async fn purge_stream(&self, stream: &str) -> Result<u64> {
        let stream_handle = self
            .context
            .get_stream(stream)
            .await
            .map_err(|_| BrokerError::StreamNotFound(stream.to_string()))?;
        let response = stream_handle
            .purge()
            .await
            .map_err(|e| BrokerError::Stream(e.to_string()))?;
        Ok(response.purged)
    }

    async fn list_consumers(&self, stream: &str) -> Result<Vec<String>> {
        let stream_handle = self
            .context
            .get_stream(stream)
            .await
            .map_err(|_| BrokerError::StreamNotFound(stream.to_string()))?;
        stream_handle
            .consumer_names()
            .try_collect()
            .await
            .map_err(|e| BrokerError::Consumer(e.to_string()))
    }
}
