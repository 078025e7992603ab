// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Handoff Repository
//!
//! Persistence contract for finalized handoffs, implemented in
//! `crate::infrastructure::handoff_store`.
//!
//! | Implementation | Backing |
//! |----------------|---------|
//! | `InMemoryHandoffRepository` | process memory, for tests and embedded runs |
//! | `FileHandoffRepository` | one `<job_id>.json` per job in a directory |

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::handoff::HandoffContext;
use crate::domain::job::JobId;

#[async_trait]
pub trait HandoffRepository: Send + Sync {
    /// Save a handoff, replacing any previous one for the same job. Provisional
    /// checkpoints are overwritten by the finalized handoff.
    async fn save(&self, handoff: &HandoffContext) -> Result<(), RepositoryError>;

    async fn find_by_job(&self, job_id: JobId) -> Result<Option<HandoffContext>, RepositoryError>;

    /// Most recently finalized handoff for a feature. Provisional checkpoints are ignored.
    async fn latest_for_feature(&self, feature: &str) -> Result<Option<HandoffContext>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<HandoffContext>, RepositoryError>;
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RepositoryError {
    fn from(err: std::io::Error) -> Self {
        RepositoryError::Storage(err.to_string())
    }
}
