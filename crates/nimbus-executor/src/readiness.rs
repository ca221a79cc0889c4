// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One-shot startup gate.
//!
//! Consumers may only start once the broker client is connected and the
//! topology has been provisioned. Both conditions are tracked as separate
//! signals; the gate opens when both are set and stays open.

use tokio::sync::watch;

/// Gate combining the client and admin readiness signals.
#[derive(Debug)]
pub struct ReadinessGate {
    client: watch::Sender<bool>,
    admin: watch::Sender<bool>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    /// Create a closed gate.
    pub fn new() -> Self {
        Self {
            client: watch::Sender::new(false),
            admin: watch::Sender::new(false),
        }
    }

    /// Mark the broker client as connected.
    pub fn mark_client_ready(&self) {
        self.client.send_replace(true);
    }

    /// Mark streams and consumers as provisioned.
    pub fn mark_admin_ready(&self) {
        self.admin.send_replace(true);
    }

    /// Whether both signals are set.
    pub fn is_ready(&self) -> bool {
        *self.client.borrow() && *self.admin.borrow()
    }

    /// Wait until both signals are set.
    pub async fn wait(&self) {
        let mut client = self.client.subscribe();
        let mut admin = self.admin.subscribe();
        // The senders live as long as `self`, so `wait_for` cannot fail here.
        let _ = client.wait_for(|ready| *ready).await;
        let _ = admin.wait_for(|ready| *ready).await;
    }
}
