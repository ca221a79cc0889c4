// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock sandbox for testing.
//!
//! Simulates container runs without Docker. Outcomes can be scripted per
//! call; once the script is exhausted the default outcome is used.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;
use crate::messages::FunctionOutput;

/// What a mock execution does.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Print the parameters joined by spaces and exit 0.
    Echo,
    /// Return this output.
    Output(FunctionOutput),
    /// Fail with a runtime error carrying this message.
    Fail(String),
    /// Run until the request timeout, then fail with a timeout.
    Hang,
}

/// Mock sandbox for testing.
pub struct MockSandbox {
    script: Mutex<VecDeque<MockOutcome>>,
    default: MockOutcome,
    /// Simulated execution time
    pub execution_delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl Default for MockSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSandbox {
    fn with_default(default: MockOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            execution_delay: Duration::from_millis(10),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a mock sandbox that echoes its parameters.
    pub fn new() -> Self {
        Self::with_default(MockOutcome::Echo)
    }

    /// Create a mock sandbox that always returns `output`.
    pub fn returning(output: FunctionOutput) -> Self {
        Self::with_default(MockOutcome::Output(output))
    }

    /// Create a mock sandbox where every execution fails.
    pub fn failing() -> Self {
        Self::with_default(MockOutcome::Fail("Mock failure".to_string()))
    }

    /// Create a mock sandbox whose executions run into their timeout.
    pub fn never_completing() -> Self {
        Self::with_default(MockOutcome::Hang)
    }

    /// Create a mock sandbox that fails `n` times, then echoes.
    pub fn failing_first(n: usize) -> Self {
        Self {
            script: Mutex::new(
                (0..n)
                    .map(|i| MockOutcome::Fail(format!("Mock failure {}", i + 1)))
                    .collect(),
            ),
            ..Self::new()
        }
    }

    /// Set the simulated execution time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.execution_delay = delay;
        self
    }

    /// Queue an outcome for the next unscripted call.
    pub async fn push_outcome(&self, outcome: MockOutcome) {
        self.script.lock().await.push_back(outcome);
    }

    /// Number of executions so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub async fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn sandbox_type(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<FunctionOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());

        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if !self.execution_delay.is_zero() && !matches!(outcome, MockOutcome::Hang) {
            tokio::time::sleep(self.execution_delay).await;
        }

        match outcome {
            MockOutcome::Echo => Ok(FunctionOutput::new(request.parameters.join(" "), 0)),
            MockOutcome::Output(output) => Ok(output),
            MockOutcome::Fail(message) => Err(SandboxError::Runtime(message)),
            MockOutcome::Hang => {
                tokio::time::sleep(request.timeout).await;
                Err(SandboxError::Timeout(request.timeout))
            }
        }
    }
}
