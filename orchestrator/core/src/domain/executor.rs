// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Executor Capability
//!
//! The opaque task body behind a job. The coordinator invokes [`Executor::execute`] under
//! the timeout supervisor and observes progress through the [`ExecutionContext`].
//!
//! Executors must treat each step as atomic: once [`ExecutionContext::winding_down`]
//! returns `true` they finish the step in hand and return without starting another.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::handoff::{BuildStatus, FileChange, HandoffContext};
use crate::domain::job::{Job, JobId};
use crate::domain::retry::ErrorClass;

/// Progress observed while a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressReport {
    StepCompleted(String),
    FileTouched { path: String, change: FileChange },
    BuildStatus(BuildStatus),
    NextSteps(Vec<String>),
    /// A Ship job entered its post-deploy verification window.
    VerificationStarted,
}

/// Receives progress reports on behalf of the coordinator.
pub trait ProgressSink: Send + Sync {
    fn report(&self, job_id: JobId, attempt: u32, report: ProgressReport);
}

/// Sink that drops every report.
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn report(&self, _job_id: JobId, _attempt: u32, _report: ProgressReport) {}
}

#[derive(Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Message of the failure that caused this retry, if any.
    pub previous_error: Option<String>,
    /// Latest finalized handoff for the same feature.
    pub predecessor: Option<HandoffContext>,
    wind_down: CancellationToken,
    verifying: Arc<AtomicBool>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .field("winding_down", &self.winding_down())
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    pub fn new(job_id: JobId, attempt: u32, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            job_id,
            attempt,
            previous_error: None,
            predecessor: None,
            wind_down: CancellationToken::new(),
            verifying: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    /// Context whose progress goes nowhere.
    pub fn detached(job_id: JobId) -> Self {
        Self::new(job_id, 1, Arc::new(NullProgressSink))
    }

    pub fn with_previous_error(mut self, error: Option<String>) -> Self {
        self.previous_error = error;
        self
    }

    pub fn with_predecessor(mut self, predecessor: Option<HandoffContext>) -> Self {
        self.predecessor = predecessor;
        self
    }

    pub fn record_step(&self, step: impl Into<String>) {
        self.report(ProgressReport::StepCompleted(step.into()));
    }

    pub fn record_file(&self, path: impl Into<String>, change: FileChange) {
        self.report(ProgressReport::FileTouched {
            path: path.into(),
            change,
        });
    }

    pub fn set_build_status(&self, status: BuildStatus) {
        self.report(ProgressReport::BuildStatus(status));
    }

    pub fn set_next_steps(&self, steps: Vec<String>) {
        self.report(ProgressReport::NextSteps(steps));
    }

    /// Marks the start of post-deploy verification. At the hard deadline the supervisor
    /// consults the deployment platform instead of timing out blindly.
    pub fn enter_verification(&self) {
        if !self.verifying.swap(true, Ordering::SeqCst) {
            self.report(ProgressReport::VerificationStarted);
        }
    }

    pub fn is_verifying(&self) -> bool {
        self.verifying.load(Ordering::SeqCst)
    }

    pub fn winding_down(&self) -> bool {
        self.wind_down.is_cancelled()
    }

    /// Resolves once the soft deadline has passed.
    pub async fn wind_down_requested(&self) {
        self.wind_down.cancelled().await
    }

    /// Gate before each new atomic step.
    pub fn may_start_step(&self) -> bool {
        !self.winding_down()
    }

    pub(crate) fn request_wind_down(&self) {
        self.wind_down.cancel();
    }

    fn report(&self, report: ProgressReport) {
        self.sink.report(self.job_id, self.attempt, report);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Remaining work, if the executor stopped early (for example on wind-down).
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub build_status: Option<BuildStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
    /// Explicit classification, overriding exit-code and message heuristics.
    #[serde(default)]
    pub class_hint: Option<ErrorClass>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Compiler output or similar detail, surfaced in the handoff on exhaustion.
    #[serde(default)]
    pub diagnostic: Option<String>,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class_hint: None,
            exit_code: None,
            diagnostic: None,
        }
    }

    pub fn classified(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class_hint: Some(class),
            ..Self::new(message)
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::classified(ErrorClass::Transient, message)
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::classified(ErrorClass::Build, message)
    }

    pub fn deploy(message: impl Into<String>) -> Self {
        Self::classified(ErrorClass::Deploy, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::classified(ErrorClass::Auth, message)
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }
}

/// Runs the body of a job. On a retry the same job is executed again with
/// `ctx.attempt` incremented and `ctx.previous_error` set; build-class retries are
/// expected to run an automated fix pass first.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext, job: Job) -> Result<ExecutionSummary, ExecutorError>;
}
