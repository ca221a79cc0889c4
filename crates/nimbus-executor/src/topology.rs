// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stream, subject and consumer layout shared by all instances.
//!
//! ```text
//! stream FUNCTIONS
//!   ├── Activations          ← consumer ACTIVATE (shared by every instance)
//!   └── Completed.<host>     ← consumer COMPLETE-<host> (one per instance)
//! ```

use nimbus_broker::{BrokerAdmin, BrokerError, DurableConsumerConfig};
use tracing::info;

/// Subject activations are published to.
pub const ACTIVATION_SUBJECT: &str = "Activations";

/// Prefix of the per-instance completion subjects.
pub const COMPLETION_SUBJECT_PREFIX: &str = "Completed";

/// Names used by one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Stream name.
    pub stream: String,
    /// Durable name of the shared activation consumer.
    pub activate_consumer: String,
    /// Base name of the completion consumer; the host id is appended.
    pub complete_consumer: String,
    /// Id of this instance.
    pub host_id: String,
    /// Maximum deliveries per message on both consumers.
    pub max_deliver: i64,
}

impl Topology {
    /// Default names for the given host.
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            stream: "FUNCTIONS".to_string(),
            activate_consumer: "ACTIVATE".to_string(),
            complete_consumer: "COMPLETE".to_string(),
            host_id: host_id.into(),
            max_deliver: 5,
        }
    }

    /// Subjects captured by the stream.
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![
            ACTIVATION_SUBJECT.to_string(),
            format!("{}.*", COMPLETION_SUBJECT_PREFIX),
        ]
    }

    /// Subject completions for `host` are published to.
    pub fn completion_subject(&self, host: &str) -> String {
        format!("{}.{}", COMPLETION_SUBJECT_PREFIX, host)
    }

    /// Durable name of this instance's completion consumer.
    pub fn completion_consumer(&self) -> String {
        format!("{}-{}", self.complete_consumer, self.host_id)
    }

    /// Create the stream and both consumers. Safe to call on every start.
    pub async fn provision(&self, admin: &dyn BrokerAdmin) -> Result<(), BrokerError> {
        admin
            .create_stream(&self.stream, &self.stream_subjects())
            .await?;

        admin
            .create_durable_consumer(
                &self.stream,
                &DurableConsumerConfig::new(&self.activate_consumer, self.max_deliver)
                    .filtered(ACTIVATION_SUBJECT),
            )
            .await?;

        admin
            .create_durable_consumer(
                &self.stream,
                &DurableConsumerConfig::new(self.completion_consumer(), self.max_deliver)
                    .filtered(self.completion_subject(&self.host_id)),
            )
            .await?;

        info!(
            stream = %self.stream,
            activate_consumer = %self.activate_consumer,
            complete_consumer = %self.completion_consumer(),
            max_deliver = self.max_deliver,
            "Broker topology provisioned"
        );
        Ok(())
    }
}
