// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::handoff::HandoffContext;
use crate::domain::job::{JobId, JobKind, JobState};
use crate::domain::retry::ErrorClass;

/// Job lifecycle events published by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    JobSubmitted {
        job_id: JobId,
        kind: JobKind,
        resources: BTreeSet<String>,
        urgent: bool,
        submitted_at: DateTime<Utc>,
    },
    JobWaiting {
        job_id: JobId,
        /// Running jobs holding at least one requested resource.
        blocked_by: Vec<JobId>,
        reason: String,
    },
    JobPreempted {
        job_id: JobId,
        preempted_by: JobId,
        preempted_at: DateTime<Utc>,
    },
    JobStarted {
        job_id: JobId,
        kind: JobKind,
        attempt: u32,
        started_at: DateTime<Utc>,
    },
    StepCompleted {
        job_id: JobId,
        attempt: u32,
        step: String,
    },
    SoftDeadlineReached {
        job_id: JobId,
        checkpoint: Box<HandoffContext>,
        reached_at: DateTime<Utc>,
    },
    VerificationExtended {
        job_id: JobId,
        extension: u32,
        extended_until: DateTime<Utc>,
    },
    RetryScheduled {
        job_id: JobId,
        class: ErrorClass,
        retry: u32,
        delay_ms: u64,
        error: String,
    },
    RollbackStarted {
        job_id: JobId,
        started_at: DateTime<Utc>,
    },
    JobFinished {
        job_id: JobId,
        state: JobState,
        handoff: Box<HandoffContext>,
        finished_at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::JobSubmitted { job_id, .. }
            | JobEvent::JobWaiting { job_id, .. }
            | JobEvent::JobPreempted { job_id, .. }
            | JobEvent::JobStarted { job_id, .. }
            | JobEvent::StepCompleted { job_id, .. }
            | JobEvent::SoftDeadlineReached { job_id, .. }
            | JobEvent::VerificationExtended { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. }
            | JobEvent::RollbackStarted { job_id, .. }
            | JobEvent::JobFinished { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::JobFinished { .. })
    }
}
