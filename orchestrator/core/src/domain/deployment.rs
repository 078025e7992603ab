// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::job::Job;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum DeploymentStatus {
    Healthy,
    InProgress,
    Failed(String),
    Unknown,
}

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("Deployment platform unavailable: {0}")]
    Unavailable(String),
    #[error("Rollback failed: {0}")]
    RollbackFailed(String),
}

/// Hosting platform a Ship job deploys to.
#[async_trait]
pub trait DeploymentPlatform: Send + Sync {
    /// Health of the deployment produced by `job`.
    async fn status(&self, job: &Job) -> Result<DeploymentStatus, PlatformError>;

    /// Restores the last known-good deployment. Returns a short description of what the
    /// platform did.
    async fn rollback(&self, job: &Job) -> Result<String, PlatformError>;
}
