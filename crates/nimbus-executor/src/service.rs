// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function-level facade over the orchestrator.
//!
//! Request handlers work with function names; the orchestrator only knows
//! images. [`FunctionService`] resolves a name through a [`FunctionCatalog`]
//! and queues the resolved image on behalf of the authenticated user.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TaskError;
use crate::messages::{FunctionOutput, Parameters};
use crate::orchestrator::TaskOrchestrator;

/// A deployed function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    /// Name the owner calls the function by.
    pub name: String,
    /// Container image implementing the function.
    pub image: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// User owning the function.
    pub owner: String,
}

/// Resolves function names to definitions.
#[async_trait]
pub trait FunctionCatalog: Send + Sync {
    /// Look up `name` among the functions owned by `owner`.
    async fn find(&self, owner: &str, name: &str) -> Option<FunctionDefinition>;
}

/// Catalog kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryFunctionCatalog {
    functions: RwLock<HashMap<(String, String), FunctionDefinition>>,
}

impl InMemoryFunctionCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a function.
    pub fn register(&self, function: FunctionDefinition) {
        let key = (function.owner.clone(), function.name.clone());
        self.functions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, function);
    }

    /// Functions owned by `owner`, sorted by name.
    pub fn list_for_user(&self, owner: &str) -> Vec<FunctionDefinition> {
        let mut functions: Vec<FunctionDefinition> = self
            .functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|f| f.owner == owner)
            .cloned()
            .collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        functions
    }
}

#[async_trait]
impl FunctionCatalog for InMemoryFunctionCatalog {
    async fn find(&self, owner: &str, name: &str) -> Option<FunctionDefinition> {
        self.functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(owner.to_string(), name.to_string()))
            .cloned()
    }
}

/// Executes functions by name.
#[derive(Clone)]
pub struct FunctionService {
    catalog: Arc<dyn FunctionCatalog>,
    orchestrator: Arc<TaskOrchestrator>,
}

impl FunctionService {
    /// Create a service resolving names through `catalog`.
    pub fn new(catalog: Arc<dyn FunctionCatalog>, orchestrator: Arc<TaskOrchestrator>) -> Self {
        Self {
            catalog,
            orchestrator,
        }
    }

    /// Run the function `name` owned by `username` and wait for its output.
    pub async fn execute_function(
        &self,
        name: &str,
        parameters: impl Into<Parameters>,
        username: &str,
    ) -> Result<FunctionOutput, TaskError> {
        if name.trim().is_empty() {
            return Err(TaskError::InvalidRequest(
                "function name must not be empty".to_string(),
            ));
        }
        if username.trim().is_empty() {
            return Err(TaskError::InvalidRequest(
                "username must not be empty".to_string(),
            ));
        }

        let function = self
            .catalog
            .find(username, name)
            .await
            .ok_or_else(|| TaskError::FunctionNotFound(name.to_string()))?;

        debug!(function = %name, image = %function.image, username = %username, "Resolved function");
        self.orchestrator
            .queue(&function.image, parameters, username)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(owner: &str, name: &str) -> FunctionDefinition {
        FunctionDefinition {
            name: name.to_string(),
            image: format!("registry.local/{}/{}", owner, name),
            description: String::new(),
            owner: owner.to_string(),
        }
    }

    #[tokio::test]
    async fn test_catalog_is_scoped_per_owner() {
        let catalog = InMemoryFunctionCatalog::new();
        catalog.register(function("alice", "resize"));
        catalog.register(function("bob", "resize"));

        let found = catalog.find("alice", "resize").await.unwrap();
        assert_eq!(found.image, "registry.local/alice/resize");
        assert!(catalog.find("carol", "resize").await.is_none());
    }

    #[test]
    fn test_list_for_user_sorted() {
        let catalog = InMemoryFunctionCatalog::new();
        catalog.register(function("alice", "thumbnail"));
        catalog.register(function("alice", "resize"));
        catalog.register(function("bob", "crop"));

        let names: Vec<String> = catalog
            .list_for_user("alice")
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["resize", "thumbnail"]);
    }

    #[test]
    fn test_register_replaces() {
        let catalog = InMemoryFunctionCatalog::new();
        catalog.register(function("alice", "resize"));
        let mut updated = function("alice", "resize");
        updated.image = "registry.local/alice/resize:v2".to_string();
        catalog.register(updated);

        let listed = catalog.list_for_user("alice");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].image, "registry.local/alice/resize:v2");
    }
}
