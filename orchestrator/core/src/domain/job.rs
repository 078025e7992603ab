// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Job Aggregate
//!
//! A [`Job`] is one unit of work submitted to the coordinator: a [`JobKind`], the
//! set of resources it will touch and its lifecycle [`JobState`].
//!
//! ## State Machine
//! ```text
//! Queued ──▶ Waiting ──▶ Running ──▶ Succeeded | Failed | RolledBack | TimedOut
//!   │  ▲        │           │
//!   │  └────────┘           └──▶ Queued (retry scheduled)
//!   └──▶ Cancelled ◀── Waiting
//! ```
//!
//! The resource set is fixed at submission and never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task category. Drives priority, concurrency ceiling, deadlines and preconditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Repair a broken build or failing behaviour.
    Fix,
    /// Deploy to the hosting platform.
    Ship,
    /// Feature generation.
    Vibe,
    /// Cosmetic / formatting work.
    Style,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [JobKind::Fix, JobKind::Ship, JobKind::Vibe, JobKind::Style];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Fix => "fix",
            JobKind::Ship => "ship",
            JobKind::Vibe => "vibe",
            JobKind::Style => "style",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fix" => Ok(JobKind::Fix),
            "ship" => Ok(JobKind::Ship),
            "vibe" => Ok(JobKind::Vibe),
            "style" => Ok(JobKind::Style),
            other => Err(format!(
                "unknown job kind '{}', expected one of: fix, ship, vibe, style",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Waiting,
    Running,
    Succeeded,
    Failed,
    RolledBack,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded
                | JobState::Failed
                | JobState::RolledBack
                | JobState::TimedOut
                | JobState::Cancelled
        )
    }

    /// Pending jobs sit in the queue and may still be cancelled.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Waiting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::RolledBack => "rolled_back",
            JobState::TimedOut => "timed_out",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied submission parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub kind: JobKind,
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub urgent: bool,
    /// Feature name linking sequential jobs; the latest finalized handoff for the
    /// same feature is handed to the next job that runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
}

impl JobRequest {
    pub fn new<I, S>(kind: JobKind, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            resources: resources.into_iter().map(Into::into).collect(),
            urgent: false,
            feature: None,
        }
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    resources: BTreeSet<String>,
    pub state: JobState,
    pub urgent: bool,
    pub feature: Option<String>,
    /// Set on corrective Fix jobs admitted after a rollback.
    pub corrective_of: Option<JobId>,
    /// 1-based attempt number of the current or last run; 0 before the first run.
    pub attempt: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Resource names are trimmed and empty names are rejected.
pub fn normalize_resources(resources: &BTreeSet<String>) -> Result<BTreeSet<String>, String> {
    let mut normalized = BTreeSet::new();
    for resource in resources {
        let trimmed = resource.trim();
        if trimmed.is_empty() {
            return Err("resource names must not be empty".to_string());
        }
        normalized.insert(trimmed.to_string());
    }
    Ok(normalized)
}

impl Job {
    pub fn new(id: JobId, request: JobRequest) -> Self {
        Self {
            id,
            kind: request.kind,
            resources: request.resources,
            state: JobState::Queued,
            urgent: request.urgent,
            feature: request.feature,
            corrective_of: None,
            attempt: 0,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn resources(&self) -> &BTreeSet<String> {
        &self.resources
    }

    pub fn touches_any(&self, resources: &BTreeSet<String>) -> bool {
        !self.resources.is_disjoint(resources)
    }

    pub fn start(&mut self) {
        self.state = JobState::Running;
        self.attempt += 1;
        self.started_at = Some(Utc::now());
    }

    pub fn wait(&mut self) {
        self.state = JobState::Waiting;
    }

    pub fn requeue(&mut self) {
        self.state = JobState::Queued;
    }

    pub fn finish(&mut self, state: JobState) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Fix".parse::<JobKind>().unwrap(), JobKind::Fix);
        assert_eq!(" style ".parse::<JobKind>().unwrap(), JobKind::Style);
        assert!("deploy".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_lifecycle_counts_attempts() {
        let mut job = Job::new(JobId::new(), JobRequest::new(JobKind::Vibe, ["src/app.rs"]));
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 0);

        job.start();
        assert_eq!(job.attempt, 1);
        job.requeue();
        job.start();
        assert_eq!(job.attempt, 2);

        job.finish(JobState::Succeeded);
        assert!(job.state.is_terminal());
        assert!(job.ended_at.is_some());
    }

    #[test]
    fn test_normalize_resources_rejects_blank_names() {
        let ok: BTreeSet<String> = [" a.rs ".to_string(), "b.rs".to_string()].into();
        let normalized = normalize_resources(&ok).unwrap();
        assert!(normalized.contains("a.rs"));

        let bad: BTreeSet<String> = ["  ".to_string()].into();
        assert!(normalize_resources(&bad).is_err());
    }
}
