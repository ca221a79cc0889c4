// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-user concurrency limit on top of the shared counter store.
//!
//! Admission is a single atomic `fetch_update` on `<username>.activations.active`:
//! the counter is incremented only while it is below the limit, so concurrent
//! admissions on different instances cannot both take the last slot. Release
//! decrements with a floor of zero.

use std::sync::Arc;

use nimbus_broker::{BrokerError, CounterStore};
use tracing::{debug, warn};

use crate::error::TaskError;

/// Counter key holding the active activations of `username`.
pub fn active_key(username: &str) -> String {
    format!("{}.activations.active", username)
}

/// Admits activations while a user is under the limit.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    counters: Arc<dyn CounterStore>,
    limit: i64,
}

impl ConcurrencyLimiter {
    /// Create a limiter allowing `limit` activations per user.
    pub fn new(counters: Arc<dyn CounterStore>, limit: i64) -> Self {
        Self { counters, limit }
    }

    /// Configured maximum.
    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Activations `username` currently has in flight.
    pub async fn active(&self, username: &str) -> Result<i64, BrokerError> {
        Ok(self
            .counters
            .get(&active_key(username))
            .await?
            .unwrap_or(0))
    }

    /// Take a slot for `username`, or fail if the user is at the limit.
    pub async fn acquire(&self, username: &str) -> Result<ActivationSlot, TaskError> {
        let key = active_key(username);
        let limit = self.limit;
        let admit = move |active: i64| (active < limit).then_some(active + 1);

        match self.counters.fetch_update(&key, &admit).await {
            Ok(Ok(previous)) => {
                debug!(username = %username, active = previous + 1, limit, "Activation admitted");
                Ok(ActivationSlot {
                    counters: self.counters.clone(),
                    key,
                    released: false,
                })
            }
            Ok(Err(active)) => Err(TaskError::ConcurrencyLimitExceeded {
                username: username.to_string(),
                active,
                limit,
            }),
            Err(e) => Err(TaskError::Counter(e)),
        }
    }
}

/// One admitted activation.
///
/// Call [`release`](Self::release) when the task ends. A slot dropped
/// without release is released in the background.
pub struct ActivationSlot {
    counters: Arc<dyn CounterStore>,
    key: String,
    released: bool,
}

async fn decrement(counters: &dyn CounterStore, key: &str) -> Result<(), BrokerError> {
    let floor_at_zero = |active: i64| Some((active - 1).max(0));
    counters.fetch_update(key, &floor_at_zero).await?;
    Ok(())
}

impl ActivationSlot {
    /// Give the slot back.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = decrement(self.counters.as_ref(), &self.key).await {
            warn!(key = %self.key, error = %e, "Failed to release activation slot");
        }
    }
}

impl Drop for ActivationSlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let counters = self.counters.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = decrement(counters.as_ref(), &key).await {
                        warn!(key = %key, error = %e, "Failed to release activation slot");
                    }
                });
            }
            Err(_) => warn!(key = %key, "Activation slot leaked outside of a runtime"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_broker::memory::MemoryCounterStore;
    use std::time::Duration;

    fn limiter(limit: i64) -> (Arc<MemoryCounterStore>, ConcurrencyLimiter) {
        let store = Arc::new(MemoryCounterStore::new());
        (store.clone(), ConcurrencyLimiter::new(store, limit))
    }

    #[tokio::test]
    async fn test_admits_up_to_limit() {
        let (_store, limiter) = limiter(2);
        let a = limiter.acquire("alice").await.unwrap();
        let b = limiter.acquire("alice").await.unwrap();

        let err = match limiter.acquire("alice").await {
            Ok(_) => panic!("third slot should be rejected"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            TaskError::ConcurrencyLimitExceeded {
                active: 2,
                limit: 2,
                ..
            }
        ));
        assert_eq!(limiter.active("alice").await.unwrap(), 2);

        // Other users are unaffected.
        limiter.acquire("bob").await.unwrap().release().await;

        a.release().await;
        b.release().await;
        assert_eq!(limiter.active("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_floors_at_zero() {
        let (store, limiter) = limiter(2);
        let slot = limiter.acquire("alice").await.unwrap();
        store.put(&active_key("alice"), 0).await.unwrap();

        slot.release().await;
        assert_eq!(store.get(&active_key("alice")).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_dropped_slot_is_released() {
        let (_store, limiter) = limiter(1);
        drop(limiter.acquire("alice").await.unwrap());

        for _ in 0..50 {
            if limiter.active("alice").await.unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dropped slot was not released");
    }

    #[tokio::test]
    async fn test_concurrent_admissions_respect_limit() {
        let (_store, limiter) = limiter(3);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire("alice").await }));
        }

        let mut admitted = Vec::new();
        for handle in handles {
            if let Ok(slot) = handle.await.unwrap() {
                admitted.push(slot);
            }
        }
        assert_eq!(admitted.len(), 3);
        assert_eq!(limiter.active("alice").await.unwrap(), 3);
    }

    #[test]
    fn test_key_format() {
        assert_eq!(active_key("alice"), "alice.activations.active");
    }
}
