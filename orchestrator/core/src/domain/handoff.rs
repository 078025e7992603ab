// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Handoff Context
//!
//! A structured, resumable snapshot of a job's progress, written so that the next job
//! (or a human) can pick up where this one stopped.
//!
//! - [`HandoffBuilder`] is the only mutable form. The running job owns it and appends
//!   steps and touched files as they happen.
//! - [`HandoffContext`] is produced by [`HandoffBuilder::finalize`], which consumes the
//!   builder. A finalized context has no mutators.
//! - [`HandoffDocument`] is the camelCase wire format. `HandoffContext` serializes through
//!   it, so JSON round trips are lossless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::domain::error::JobError;
use crate::domain::job::{Job, JobId, JobKind, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Unknown,
    Passing,
    Failing,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Unknown => "unknown",
            BuildStatus::Passing => "passing",
            BuildStatus::Failing => "failing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChange {
    Modified,
    Created,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    /// Includes precondition rejections (`JobError::Validation`).
    Failed { error: JobError },
    RolledBack {
        error: JobError,
        /// What the deployment platform reported for the rollback itself.
        rollback: String,
    },
    TimedOut { error: JobError },
    Cancelled { reason: String },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded => JobState::Succeeded,
            JobOutcome::Failed { .. } => JobState::Failed,
            JobOutcome::RolledBack { .. } => JobState::RolledBack,
            JobOutcome::TimedOut { .. } => JobState::TimedOut,
            JobOutcome::Cancelled { .. } => JobState::Cancelled,
        }
    }

    pub fn error(&self) -> Option<&JobError> {
        match self {
            JobOutcome::Failed { error }
            | JobOutcome::RolledBack { error, .. }
            | JobOutcome::TimedOut { error } => Some(error),
            JobOutcome::Succeeded | JobOutcome::Cancelled { .. } => None,
        }
    }
}

/// Mutable draft of a handoff, owned by the running job.
#[derive(Debug, Clone)]
pub struct HandoffBuilder {
    job_id: JobId,
    kind: JobKind,
    feature: Option<String>,
    attempts: u32,
    completed_steps: Vec<String>,
    files_modified: BTreeSet<String>,
    files_created: BTreeSet<String>,
    build_status: BuildStatus,
    last_error: Option<String>,
    next_steps: Vec<String>,
    blocking_issue: Option<String>,
}

impl HandoffBuilder {
    pub fn new(job: &Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            feature: job.feature.clone(),
            attempts: job.attempt,
            completed_steps: Vec::new(),
            files_modified: BTreeSet::new(),
            files_created: BTreeSet::new(),
            build_status: BuildStatus::Unknown,
            last_error: None,
            next_steps: Vec::new(),
            blocking_issue: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn append(&mut self, step: impl Into<String>) {
        let step = step.into();
        // a completed step is no longer a next step
        self.next_steps.retain(|s| *s != step);
        self.completed_steps.push(step);
    }

    /// A file created during the job stays "created" even if modified afterwards.
    pub fn record_file(&mut self, path: impl Into<String>, change: FileChange) {
        let path = path.into();
        match change {
            FileChange::Created => {
                self.files_modified.remove(&path);
                self.files_created.insert(path);
            }
            FileChange::Modified if !self.files_created.contains(&path) => {
                self.files_modified.insert(path);
            }
            FileChange::Modified => {}
        }
    }

    pub fn set_build_status(&mut self, status: BuildStatus) {
        self.build_status = status;
    }

    pub fn set_next_steps(&mut self, steps: Vec<String>) {
        self.next_steps = steps;
    }

    pub fn prepend_next_step(&mut self, step: impl Into<String>) {
        self.next_steps.insert(0, step.into());
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub fn set_blocking_issue(&mut self, issue: impl Into<String>) {
        self.blocking_issue = Some(issue.into());
    }

    pub fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    /// Snapshot of the draft, used for soft-deadline checkpoints.
    pub fn provisional(&self) -> HandoffContext {
        self.clone().build(None)
    }

    /// Seals the handoff. For failing outcomes the root classification lands in
    /// `last_error`/`blocking_issue` and the concrete next action leads `next_steps`.
    pub fn finalize(mut self, job: &Job, outcome: JobOutcome) -> HandoffContext {
        if let Some(error) = outcome.error() {
            self.last_error = Some(error.to_string());
            let issue = format!("[{}] {}", error.class_name(), error);
            self.blocking_issue = Some(match self.blocking_issue.take() {
                Some(existing) if existing != issue => format!("{}; {}", issue, existing),
                _ => issue,
            });
            let action = error.next_action(job);
            if !self.next_steps.contains(&action) {
                self.next_steps.insert(0, action);
            }
        } else if let JobOutcome::Cancelled { reason } = &outcome {
            self.blocking_issue = Some(format!("cancelled before start: {}", reason));
        }
        self.build(Some(outcome))
    }

    fn build(self, outcome: Option<JobOutcome>) -> HandoffContext {
        let progress_fraction = match &outcome {
            Some(JobOutcome::Succeeded) => 1.0,
            _ => {
                let done = self.completed_steps.len();
                let total = done + self.next_steps.len();
                if total == 0 {
                    0.0
                } else {
                    done as f64 / total as f64
                }
            }
        };
        let finalized_at = outcome.as_ref().map(|_| Utc::now());
        HandoffContext {
            job_id: self.job_id,
            kind: self.kind,
            feature: self.feature,
            outcome,
            attempts: self.attempts,
            completed_steps: self.completed_steps,
            files_modified: self.files_modified.into_iter().collect(),
            files_created: self.files_created.into_iter().collect(),
            build_status: self.build_status,
            last_error: self.last_error,
            next_steps: self.next_steps,
            blocking_issue: self.blocking_issue,
            progress_fraction,
            finalized_at,
        }
    }
}

/// Immutable handoff. Provisional snapshots have no outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "HandoffDocument", from = "HandoffDocument")]
pub struct HandoffContext {
    job_id: JobId,
    kind: JobKind,
    feature: Option<String>,
    outcome: Option<JobOutcome>,
    attempts: u32,
    completed_steps: Vec<String>,
    files_modified: Vec<String>,
    files_created: Vec<String>,
    build_status: BuildStatus,
    last_error: Option<String>,
    next_steps: Vec<String>,
    blocking_issue: Option<String>,
    progress_fraction: f64,
    finalized_at: Option<DateTime<Utc>>,
}

impl HandoffContext {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn feature(&self) -> Option<&str> {
        self.feature.as_deref()
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_final(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    pub fn files_modified(&self) -> &[String] {
        &self.files_modified
    }

    pub fn files_created(&self) -> &[String] {
        &self.files_created
    }

    pub fn build_status(&self) -> BuildStatus {
        self.build_status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn next_steps(&self) -> &[String] {
        &self.next_steps
    }

    pub fn blocking_issue(&self) -> Option<&str> {
        self.blocking_issue.as_deref()
    }

    pub fn progress_fraction(&self) -> f64 {
        self.progress_fraction
    }

    pub fn finalized_at(&self) -> Option<DateTime<Utc>> {
        self.finalized_at
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Human-readable rendering for operators.
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let status = match &self.outcome {
            Some(outcome) => outcome.state().to_string(),
            None => "in progress (provisional)".to_string(),
        };
        let _ = writeln!(out, "# Handoff: {} job {}", self.kind, self.job_id);
        let _ = writeln!(out);
        let _ = writeln!(out, "- **Status:** {}", status);
        if let Some(feature) = &self.feature {
            let _ = writeln!(out, "- **Feature:** {}", feature);
        }
        let _ = writeln!(out, "- **Attempts:** {}", self.attempts);
        let _ = writeln!(out, "- **Build:** {}", self.build_status.as_str());
        let _ = writeln!(out, "- **Progress:** {:.0}%", self.progress_fraction * 100.0);
        if let Some(issue) = &self.blocking_issue {
            let _ = writeln!(out, "- **Blocking issue:** {}", issue);
        }
        if let Some(error) = &self.last_error {
            let _ = writeln!(out, "- **Last error:** {}", error);
        }

        section(&mut out, "Completed", &self.completed_steps, true);
        section(&mut out, "Files modified", &self.files_modified, false);
        section(&mut out, "Files created", &self.files_created, false);
        section(&mut out, "Next steps", &self.next_steps, true);
        out
    }
}

fn section(out: &mut String, title: &str, items: &[String], numbered: bool) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "## {}", title);
    let _ = writeln!(out);
    for (i, item) in items.iter().enumerate() {
        if numbered {
            let _ = writeln!(out, "{}. {}", i + 1, item);
        } else {
            let _ = writeln!(out, "- `{}`", item);
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffDocument {
    pub job_id: JobId,
    pub kind: JobKind,
    #[serde(default)]
    pub outcome: Option<JobOutcome>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub completed: Vec<String>,
    pub current_state: CurrentState,
    #[serde(default)]
    pub next_steps: Vec<String>,
    pub resume_context: ResumeContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub build_status: BuildStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeContext {
    #[serde(default)]
    pub feature: Option<String>,
    #[serde(default)]
    pub progress_fraction: f64,
    #[serde(default)]
    pub blocking_issue: Option<String>,
}

impl From<HandoffContext> for HandoffDocument {
    fn from(ctx: HandoffContext) -> Self {
        Self {
            job_id: ctx.job_id,
            kind: ctx.kind,
            outcome: ctx.outcome,
            attempts: ctx.attempts,
            completed: ctx.completed_steps,
            current_state: CurrentState {
                files_modified: ctx.files_modified,
                files_created: ctx.files_created,
                build_status: ctx.build_status,
                last_error: ctx.last_error,
            },
            next_steps: ctx.next_steps,
            resume_context: ResumeContext {
                feature: ctx.feature,
                progress_fraction: ctx.progress_fraction,
                blocking_issue: ctx.blocking_issue,
            },
            finalized_at: ctx.finalized_at,
        }
    }
}

impl From<HandoffDocument> for HandoffContext {
    fn from(doc: HandoffDocument) -> Self {
        Self {
            job_id: doc.job_id,
            kind: doc.kind,
            feature: doc.resume_context.feature,
            outcome: doc.outcome,
            attempts: doc.attempts,
            completed_steps: doc.completed,
            files_modified: doc.current_state.files_modified,
            files_created: doc.current_state.files_created,
            build_status: doc.current_state.build_status,
            last_error: doc.current_state.last_error,
            next_steps: doc.next_steps,
            blocking_issue: doc.resume_context.blocking_issue,
            progress_fraction: doc.resume_context.progress_fraction,
            finalized_at: doc.finalized_at,
        }
    }
}
