// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Progress signals for a message that is still being worked on.

use std::time::Duration;

use nimbus_broker::Delivery;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shortest accepted heartbeat period.
pub(crate) const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Sends `in_progress` for a delivery every `interval` until dropped.
pub struct ProgressHeartbeat {
    handle: JoinHandle<()>,
}

impl ProgressHeartbeat {
    /// Start sending progress signals.
    ///
    /// Intervals shorter than [`MIN_HEARTBEAT_INTERVAL`] are raised to it.
    pub fn start(delivery: Delivery, interval: Duration) -> Self {
        if interval < MIN_HEARTBEAT_INTERVAL {
            warn!(
                interval_ms = interval.as_millis() as u64,
                "Heartbeat interval too short, using minimum"
            );
        }
        let interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match delivery.in_progress().await {
                    Ok(()) => debug!(subject = %delivery.subject, "Sent progress heartbeat"),
                    Err(e) => warn!(error = %e, "Failed to send progress heartbeat"),
                }
            }
        });
        Self { handle }
    }

    /// Stop sending progress signals.
    pub fn stop(self) {}
}

impl Drop for ProgressHeartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
