// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tasks waiting for their completion on this instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::messages::CompletionOutcome;

type Waiters = HashMap<Uuid, oneshot::Sender<CompletionOutcome>>;

/// Correlation table from task id to the caller waiting for it.
#[derive(Debug, Clone, Default)]
pub struct PendingTasks {
    waiters: Arc<Mutex<Waiters>>,
}

impl PendingTasks {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a task. The entry is removed when the returned guard drops.
    pub fn register(&self, task_id: Uuid) -> (PendingGuard, oneshot::Receiver<CompletionOutcome>) {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(task_id, tx);
        let guard = PendingGuard {
            tasks: self.clone(),
            task_id,
        };
        (guard, rx)
    }

    /// Hand an outcome to the waiting caller.
    ///
    /// Returns `false` if no caller is waiting for `task_id` any more.
    pub fn resolve(&self, task_id: &Uuid, outcome: CompletionOutcome) -> bool {
        match self.lock().remove(task_id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Whether a caller is waiting for `task_id`.
    pub fn contains(&self, task_id: &Uuid) -> bool {
        self.lock().contains_key(task_id)
    }

    /// Number of waiting callers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no caller is waiting.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every waiter; their callers observe a closed channel.
    pub fn clear(&self) -> usize {
        let mut waiters = self.lock();
        let count = waiters.len();
        waiters.clear();
        count
    }
}

/// Removes a pending task when dropped.
#[derive(Debug)]
pub struct PendingGuard {
    tasks: PendingTasks,
    task_id: Uuid,
}

impl PendingGuard {
    /// Task this guard belongs to.
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.tasks.lock().remove(&self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::FunctionOutput;

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let tasks = PendingTasks::new();
        let task_id = Uuid::new_v4();
        let (_guard, rx) = tasks.register(task_id);

        assert!(tasks.resolve(
            &task_id,
            CompletionOutcome::Result(FunctionOutput::new("hi", 0))
        ));
        assert_eq!(
            rx.await.unwrap(),
            CompletionOutcome::Result(FunctionOutput::new("hi", 0))
        );
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_guard_removes_entry() {
        let tasks = PendingTasks::new();
        let task_id = Uuid::new_v4();
        {
            let (guard, _rx) = tasks.register(task_id);
            assert_eq!(guard.task_id(), task_id);
            assert!(tasks.contains(&task_id));
        }
        assert!(!tasks.contains(&task_id));
        assert!(!tasks.resolve(&task_id, CompletionOutcome::Error("late".to_string())));
    }

    #[test]
    fn test_resolve_unknown_task() {
        let tasks = PendingTasks::new();
        assert!(!tasks.resolve(&Uuid::new_v4(), CompletionOutcome::Error("x".to_string())));
    }

    #[tokio::test]
    async fn test_clear_closes_channels() {
        let tasks = PendingTasks::new();
        let (_guard, rx) = tasks.register(Uuid::new_v4());
        assert_eq!(tasks.clear(), 1);
        assert!(rx.await.is_err());
    }
}
