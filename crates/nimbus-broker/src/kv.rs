// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Counter store on top of a JetStream key-value bucket.
//!
//! Values are written as decimal strings. `fetch_update` is a compare-and-swap
//! loop on the entry revision, so concurrent writers on different instances
//! never lose an update.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::traits::CounterStore;

/// Maximum compare-and-swap attempts before giving up.
const MAX_CAS_ATTEMPTS: u32 = 16;

/// Base delay between conflicting compare-and-swap attempts.
const CAS_BACKOFF_BASE: Duration = Duration::from_millis(2);

/// Linear backoff capped at 50ms.
fn cas_backoff(attempt: u32) -> Duration {
    (CAS_BACKOFF_BASE * attempt).min(Duration::from_millis(50))
}

/// JetStream key-value bucket holding integer counters.
#[derive(Clone)]
pub struct JetStreamCounterStore {
    store: kv::Store,
}

impl JetStreamCounterStore {
    /// Open the bucket, creating it if it does not exist yet.
    pub async fn open(context: &jetstream::Context, bucket: &str) -> Result<Self> {
        let store = match context.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => context
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| BrokerError::KeyValue(e.to_string()))?,
        };

        debug!(bucket = %bucket, "Counter store ready");
        Ok(Self { store })
    }
}

/// Parse a stored counter value.
pub(crate) fn decode_counter(key: &str, raw: &[u8]) -> Result<i64> {
    let text = String::from_utf8_lossy(raw);
    // Older writers stored JSON numbers, which may carry quotes.
    text.trim()
        .trim_matches('"')
        .parse()
        .map_err(|_| BrokerError::InvalidCounter {
            key: key.to_string(),
            value: text.to_string(),
        })
}

fn encode_counter(value: i64) -> Bytes {
    Bytes::from(value.to_string())
}

#[async_trait]
impl CounterStore for JetStreamCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| BrokerError::KeyValue(e.to_string()))?;
        match entry {
            Some(entry) if matches!(entry.operation, kv::Operation::Put) => {
                decode_counter(key, &entry.value).map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: i64) -> Result<()> {
        self.store
            .put(key, encode_counter(value))
            .await
            .map_err(|e| BrokerError::KeyValue(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store
            .delete(key)
            .await
            .map_err(|e| BrokerError::KeyValue(e.to_string()))
    }

    async fn purge(&self, key: &str) -> Result<()> {
        self.store
            .purge(key)
            .await
            .map_err(|e| BrokerError::KeyValue(e.to_string()))
    }

    async fn fetch_update(
        &self,
        key: &str,
        f: &(dyn Fn(i64) -> Option<i64> + Send + Sync),
    ) -> Result<std::result::Result<i64, i64>> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let entry = self
                .store
                .entry(key)
                .await
                .map_err(|e| BrokerError::KeyValue(e.to_string()))?;

            let (current, revision) = match &entry {
                Some(entry) if matches!(entry.operation, kv::Operation::Put) => {
                    (decode_counter(key, &entry.value)?, Some(entry.revision))
                }
                // Deleted or purged keys keep a revision marker we must update over.
                Some(entry) => (0, Some(entry.revision)),
                None => (0, None),
            };

            let Some(next) = f(current) else {
                return Ok(Err(current));
            };

            let conflicted = match revision {
                Some(revision) => match self.store.update(key, encode_counter(next), revision).await {
                    Ok(_) => return Ok(Ok(current)),
                    Err(e) if e.kind() == kv::UpdateErrorKind::WrongLastRevision => e.to_string(),
                    Err(e) => return Err(BrokerError::KeyValue(e.to_string())),
                },
                None => match self.store.create(key, encode_counter(next)).await {
                    Ok(_) => return Ok(Ok(current)),
                    Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => e.to_string(),
                    Err(e) => return Err(BrokerError::KeyValue(e.to_string())),
                },
            };

            debug!(key = %key, attempt, error = %conflicted, "Counter write conflicted, retrying");
            tokio::time::sleep(cas_backoff(attempt)).await;
        }

        Err(BrokerError::Contention {
            key: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_decimal() {
        assert_eq!(decode_counter("k", b"3").unwrap(), 3);
        assert_eq!(decode_counter("k", b" 12\n").unwrap(), 12);
    }

    #[test]
    fn test_decode_json_string() {
        assert_eq!(decode_counter("k", b"\"5\"").unwrap(), 5);
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode_counter("alice.activations.active", b"lots").unwrap_err();
        assert!(err.to_string().contains("alice.activations.active"));
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        assert_eq!(cas_backoff(1), Duration::from_millis(2));
        assert_eq!(cas_backoff(3), Duration::from_millis(6));
        assert_eq!(cas_backoff(MAX_CAS_ATTEMPTS * 10), Duration::from_millis(50));
    }

    #[test]
    fn test_encode_is_decimal() {
        assert_eq!(encode_counter(-2), Bytes::from_static(b"-2"));
    }
}
