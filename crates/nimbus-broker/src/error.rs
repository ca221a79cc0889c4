// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the broker layer.

use thiserror::Error;

/// Errors that can occur while talking to the broker or the counter store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    #[error("connect error: {0}")]
    Connect(String),

    #[error("publish error on {subject}: {message}")]
    Publish { subject: String, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("consumer not found: {stream}/{consumer}")]
    ConsumerNotFound { stream: String, consumer: String },

    #[error("acknowledgement error: {0}")]
    Ack(String),

    #[error("key-value error: {0}")]
    KeyValue(String),

    #[error("value for key {key} is not an integer: {value}")]
    InvalidCounter { key: String, value: String },

    #[error("gave up updating {key} after {attempts} conflicting writes")]
    Contention { key: String, attempts: u32 },

    #[error("broker connection is closed")]
    Closed,
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
