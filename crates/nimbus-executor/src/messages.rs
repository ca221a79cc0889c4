// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format exchanged between nimbus instances.
//!
//! Activations and completions travel as JSON with camelCase field names.
//! Old and new instances share one stream during rolling deploys, so fields
//! added here must be optional on the decoding side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of running a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionOutput {
    /// Cleaned stdout (exit status 0) or stderr (any other status).
    pub result: String,
    /// Exit status of the container.
    pub exit_status: i32,
}

impl FunctionOutput {
    /// Create an output.
    pub fn new(result: impl Into<String>, exit_status: i32) -> Self {
        Self {
            result: result.into(),
            exit_status,
        }
    }

    /// Whether the function exited with status 0.
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

/// Invocation parameters: either a single string or a list.
///
/// A single string is treated as a one-element list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parameters {
    /// A single argument.
    One(String),
    /// An ordered list of arguments.
    Many(Vec<String>),
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters::Many(Vec::new())
    }
}

impl Parameters {
    /// The arguments as a list.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Parameters::One(arg) => vec![arg],
            Parameters::Many(args) => args,
        }
    }
}

impl From<String> for Parameters {
    fn from(value: String) -> Self {
        Parameters::One(value)
    }
}

impl From<&str> for Parameters {
    fn from(value: &str) -> Self {
        Parameters::One(value.to_string())
    }
}

impl From<Vec<String>> for Parameters {
    fn from(value: Vec<String>) -> Self {
        Parameters::Many(value)
    }
}

impl From<Vec<&str>> for Parameters {
    fn from(value: Vec<&str>) -> Self {
        Parameters::Many(value.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Parameters {
    fn from(value: [&str; N]) -> Self {
        Parameters::Many(value.into_iter().map(str::to_string).collect())
    }
}

/// Request to run an image, published on the shared activation subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    /// Correlation id of the task.
    pub task_id: Uuid,
    /// Container image reference.
    pub image: String,
    /// Arguments appended to the image's default command.
    #[serde(default)]
    pub parameters: Parameters,
    /// Instance waiting for the completion.
    pub host: String,
    /// When the activation was queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

/// What a completion carries: a result or the reason there is none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionOutcome {
    /// The function ran; its exit status may still be non-zero.
    Result(FunctionOutput),
    /// Every attempt failed.
    Error(String),
}

/// Reply to an activation, published on `Completed.<host>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    /// Correlation id copied from the activation.
    pub task_id: Uuid,
    /// Instance the completion is addressed to.
    pub host: String,
    /// Result or failure.
    #[serde(flatten)]
    pub outcome: CompletionOutcome,
}

impl Completion {
    /// Successful completion for an activation.
    pub fn success(activation: &Activation, output: FunctionOutput) -> Self {
        Self {
            task_id: activation.task_id,
            host: activation.host.clone(),
            outcome: CompletionOutcome::Result(output),
        }
    }

    /// Failure completion for an activation.
    pub fn failure(activation: &Activation, error: impl Into<String>) -> Self {
        Self {
            task_id: activation.task_id,
            host: activation.host.clone(),
            outcome: CompletionOutcome::Error(error.into()),
        }
    }
}
