// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandbox backends for running function images.

pub mod docker;
pub mod isolated;
pub mod mock;
pub mod output;
mod traits;

pub use docker::{DockerConfig, DockerSandbox};
pub use isolated::{IsolatedSandbox, WorkerPoolConfig};
pub use mock::MockSandbox;
pub use traits::*;

use std::sync::Arc;

use crate::config::SandboxIsolation;

/// Build the sandbox backend for an isolation mode.
///
/// `Process` runs every execution in a `sandbox-worker` child of the current
/// executable, bounded by `workers`. `Inline` runs containers from this
/// process.
pub fn build(
    isolation: SandboxIsolation,
    workers: usize,
    docker: DockerConfig,
) -> crate::Result<Arc<dyn Sandbox>> {
    let docker = DockerSandbox::new(docker);
    let sandbox: Arc<dyn Sandbox> = match isolation {
        SandboxIsolation::Process => Arc::new(
            IsolatedSandbox::new(WorkerPoolConfig::current_exe(workers)?).with_cleanup(docker),
        ),
        SandboxIsolation::Inline => Arc::new(docker),
    };
    Ok(sandbox)
}
