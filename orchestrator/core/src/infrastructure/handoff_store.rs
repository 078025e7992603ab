// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Handoff Repository Implementations
//!
//! - **InMemoryHandoffRepository** - `parking_lot::RwLock`-guarded map, for tests and
//!   embedded runs
//! - **FileHandoffRepository** - one pretty-printed `<job_id>.json` per job, in the
//!   camelCase handoff wire format, so the files double as operator-readable artifacts

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::handoff::HandoffContext;
use crate::domain::job::JobId;
use crate::domain::repository::{HandoffRepository, RepositoryError};

fn latest_final<'a>(handoffs: impl Iterator<Item = &'a HandoffContext>, feature: &str) -> Option<HandoffContext> {
    handoffs
        .filter(|h| h.is_final() && h.feature() == Some(feature))
        .max_by_key(|h| h.finalized_at())
        .cloned()
}

#[derive(Clone, Default)]
pub struct InMemoryHandoffRepository {
    handoffs: Arc<RwLock<HashMap<JobId, HandoffContext>>>,
}

impl InMemoryHandoffRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HandoffRepository for InMemoryHandoffRepository {
    async fn save(&self, handoff: &HandoffContext) -> Result<(), RepositoryError> {
        self.handoffs.write().insert(handoff.job_id(), handoff.clone());
        Ok(())
    }

    async fn find_by_job(&self, job_id: JobId) -> Result<Option<HandoffContext>, RepositoryError> {
        Ok(self.handoffs.read().get(&job_id).cloned())
    }

    async fn latest_for_feature(&self, feature: &str) -> Result<Option<HandoffContext>, RepositoryError> {
        Ok(latest_final(self.handoffs.read().values(), feature))
    }

    async fn list_all(&self) -> Result<Vec<HandoffContext>, RepositoryError> {
        Ok(self.handoffs.read().values().cloned().collect())
    }
}

#[derive(Debug, Clone)]
pub struct FileHandoffRepository {
    dir: PathBuf,
}

impl FileHandoffRepository {
    /// Creates the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }
}

#[async_trait]
impl HandoffRepository for FileHandoffRepository {
    async fn save(&self, handoff: &HandoffContext) -> Result<(), RepositoryError> {
        let path = self.path_for(handoff.job_id());
        let json = handoff.to_json_pretty()?;
        // write-then-rename so readers never see a torn file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(job_id = %handoff.job_id(), path = %path.display(), "Handoff saved");
        Ok(())
    }

    async fn find_by_job(&self, job_id: JobId) -> Result<Option<HandoffContext>, RepositoryError> {
        match tokio::fs::read_to_string(self.path_for(job_id)).await {
            Ok(json) => Ok(Some(HandoffContext::from_json(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn latest_for_feature(&self, feature: &str) -> Result<Option<HandoffContext>, RepositoryError> {
        let all = self.list_all().await?;
        Ok(latest_final(all.iter(), feature))
    }

    async fn list_all(&self) -> Result<Vec<HandoffContext>, RepositoryError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut handoffs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = tokio::fs::read_to_string(&path).await?;
            match HandoffContext::from_json(&json) {
                Ok(handoff) => handoffs.push(handoff),
                Err(e) => warn!(path = %path.display(), "Skipping unreadable handoff file: {}", e),
            }
        }
        Ok(handoffs)
    }
}
