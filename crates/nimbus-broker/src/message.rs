// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages handed out by durable consumers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Per-message acknowledgement channel back to the broker.
///
/// Implemented by each backend; a [`Delivery`] holds one behind an `Arc` so
/// the message can be acknowledged from a different task than the one that
/// received it (e.g. a progress heartbeat running next to the execution).
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Mark the message as processed. It will not be delivered again.
    async fn ack(&self) -> Result<()>;

    /// Negative-acknowledge the message, asking the broker to redeliver it.
    async fn nak(&self) -> Result<()>;

    /// Tell the broker the message is still being worked on, resetting its
    /// acknowledgement deadline.
    async fn in_progress(&self) -> Result<()>;
}

/// Delivery bookkeeping attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// How many times this message has been delivered, including this one.
    pub delivered: u64,
    /// Sequence of the message inside its stream.
    pub stream_sequence: u64,
}

impl DeliveryInfo {
    /// Number of earlier deliveries that were not acknowledged.
    pub fn redelivery_count(&self) -> u64 {
        self.delivered.saturating_sub(1)
    }

    /// Whether this delivery is itself a redelivery.
    pub fn is_redelivery(&self) -> bool {
        self.delivered > 1
    }
}

/// A message received from a durable consumer.
#[derive(Clone)]
pub struct Delivery {
    /// Subject the message was published to.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Delivery metadata.
    pub info: DeliveryInfo,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    /// Build a delivery from its parts. Used by broker backends.
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        info: DeliveryInfo,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            info,
            acker,
        }
    }

    /// Acknowledge the message.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negative-acknowledge the message so it is redelivered.
    pub async fn nak(&self) -> Result<()> {
        self.acker.nak().await
    }

    /// Send a "still working" progress signal for the message.
    pub async fn in_progress(&self) -> Result<()> {
        self.acker.in_progress().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("info", &self.info)
            .finish()
    }
}
