// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Error Taxonomy
//!
//! | Type | Audience |
//! |------|----------|
//! | [`SchedulerError`] | callers of the coordinator API (submit/status/cancel) |
//! | [`JobError`] | the root classification recorded in a finalized handoff |
//!
//! Resource conflicts never become a [`JobError`]: the lock manager reports them as
//! `AcquireOutcome::Conflict` and the job waits. Every variant here ends in a
//! caller-visible handoff carrying a concrete next action.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::job::{Job, JobId, JobKind, JobState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("job already running")]
    JobAlreadyRunning(JobId),

    #[error("Job {id} already finished ({state})")]
    JobAlreadyFinished { id: JobId, state: JobState },

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("Coordinator is shutting down or stopped")]
    CoordinatorStopped,
}

/// Root classification of a job failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum JobError {
    #[error("Precondition not met: {precondition} ({detail})")]
    Validation { precondition: String, detail: String },

    #[error("Transient failure after {attempts} attempt(s): {message}")]
    Transient { message: String, attempts: u32 },

    #[error("Build failed after {attempts} attempt(s): {message}")]
    Build {
        message: String,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostic: Option<String>,
    },

    #[error("Deploy failed after {attempts} attempt(s): {message}")]
    Deploy { message: String, attempts: u32 },

    #[error("Permission denied: {message}")]
    Auth { message: String },

    #[error("Hard deadline of {limit_secs}s exceeded")]
    Timeout {
        limit_secs: u64,
        /// Whether the soft deadline had already triggered a wind-down.
        degraded: bool,
    },

    #[error("Unclassified failure: {message}")]
    Unclassified {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
}

impl JobError {
    pub fn class_name(&self) -> &'static str {
        match self {
            JobError::Validation { .. } => "validation",
            JobError::Transient { .. } => "transient",
            JobError::Build { .. } => "build",
            JobError::Deploy { .. } => "deploy",
            JobError::Auth { .. } => "auth",
            JobError::Timeout { .. } => "timeout",
            JobError::Unclassified { .. } => "unclassified",
        }
    }

    /// Concrete follow-up for the operator or the next agent.
    pub fn next_action(&self, job: &Job) -> String {
        let resources = job.resources().iter().cloned().collect::<Vec<_>>().join(" ");
        match self {
            JobError::Validation { precondition, .. } => {
                format!("satisfy precondition '{}' and resubmit the {} job", precondition, job.kind)
            }
            JobError::Transient { .. } => {
                format!("check connectivity, then resubmit: baton job submit {} {}", job.kind, resources)
            }
            JobError::Build { .. } => format!("run remediation job: baton job submit fix {}", resources),
            JobError::Deploy { .. } => "inspect the deployment logs before shipping again".to_string(),
            JobError::Auth { .. } => {
                "manual intervention required: refresh credentials or permissions".to_string()
            }
            JobError::Timeout { .. } => match job.kind {
                JobKind::Ship => {
                    "manual intervention required: verify the deployment state before resubmitting"
                        .to_string()
                }
                kind => format!("resume from this handoff: baton job submit {} {}", kind, resources),
            },
            JobError::Unclassified { .. } => {
                "manual intervention required: review the full context in this handoff".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::JobRequest;

    #[test]
    fn test_deploy_next_action_makes_no_claim_about_follow_up_jobs() {
        let job = Job::new(JobId::new(), JobRequest::new(JobKind::Ship, ["deploy/prod"]));
        let error = JobError::Deploy {
            message: "health check failed".into(),
            attempts: 2,
        };
        let action = error.next_action(&job);
        assert!(action.starts_with("inspect the deployment logs"));
        assert!(!action.contains("corrective"));
    }

    #[test]
    fn test_next_action_names_remediation_job() {
        let job = Job::new(JobId::new(), JobRequest::new(JobKind::Vibe, ["src/lib.rs"]));
        let error = JobError::Build {
            message: "cargo build failed".into(),
            attempts: 2,
            diagnostic: None,
        };
        assert_eq!(error.next_action(&job), "run remediation job: baton job submit fix src/lib.rs");
    }

    #[test]
    fn test_serialized_form_is_tagged_by_class() {
        let error = JobError::Timeout { limit_secs: 600, degraded: true };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["class"], "timeout");
        let back: JobError = serde_json::from_value(json).unwrap();
        assert_eq!(back, error);
    }

    #[test]
    fn test_scheduler_error_messages() {
        let id = JobId::new();
        assert_eq!(SchedulerError::JobAlreadyRunning(id).to_string(), "job already running");
    }
}
