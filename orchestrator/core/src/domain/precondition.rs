// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Kind-specific preconditions, checked before a job takes any lock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::domain::error::JobError;
use crate::domain::job::{Job, JobKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    /// The whole workspace builds.
    CleanBuild,
    /// Version control reports no uncommitted changes.
    NoUncommittedChanges,
    /// None of the job's own resources has a build error.
    TargetsBuildClean,
}

impl Precondition {
    pub fn defaults_for(kind: JobKind) -> Vec<Precondition> {
        match kind {
            JobKind::Ship => vec![Precondition::CleanBuild, Precondition::NoUncommittedChanges],
            JobKind::Style => vec![Precondition::TargetsBuildClean],
            JobKind::Fix | JobKind::Vibe => Vec::new(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Precondition::CleanBuild => "clean_build",
            Precondition::NoUncommittedChanges => "no_uncommitted_changes",
            Precondition::TargetsBuildClean => "targets_build_clean",
        }
    }
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("workspace inspection failed: {0}")]
pub struct InspectorError(pub String);

/// Read-only view of the working tree the jobs operate on.
#[async_trait]
pub trait WorkspaceInspector: Send + Sync {
    /// Build errors, one entry per diagnostic; empty when the build passes.
    async fn build_errors(&self) -> Result<Vec<String>, InspectorError>;

    /// Paths with uncommitted changes.
    async fn uncommitted_changes(&self) -> Result<Vec<String>, InspectorError>;

    /// Build errors that mention any of `resources`.
    async fn build_errors_in(&self, resources: &BTreeSet<String>) -> Result<Vec<String>, InspectorError> {
        let errors = self.build_errors().await?;
        Ok(errors
            .into_iter()
            .filter(|line| resources.iter().any(|r| line.contains(r.as_str())))
            .collect())
    }
}

/// Checks `required` in order and stops at the first unmet precondition.
/// An inspection error counts as unmet.
pub async fn check_preconditions(
    inspector: &dyn WorkspaceInspector,
    job: &Job,
    required: &[Precondition],
) -> Result<(), JobError> {
    for precondition in required {
        let problems = match precondition {
            Precondition::CleanBuild => inspector.build_errors().await,
            Precondition::NoUncommittedChanges => inspector.uncommitted_changes().await,
            Precondition::TargetsBuildClean => inspector.build_errors_in(job.resources()).await,
        };
        let detail = match problems {
            Ok(found) if found.is_empty() => continue,
            Ok(found) => summarize(&found),
            Err(e) => e.to_string(),
        };
        return Err(JobError::Validation {
            precondition: precondition.to_string(),
            detail,
        });
    }
    Ok(())
}

fn summarize(found: &[String]) -> String {
    const SHOWN: usize = 3;
    let mut detail = found.iter().take(SHOWN).cloned().collect::<Vec<_>>().join("; ");
    if found.len() > SHOWN {
        detail.push_str(&format!(" (+{} more)", found.len() - SHOWN));
    }
    detail
}
