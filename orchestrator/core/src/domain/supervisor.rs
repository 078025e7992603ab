// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Timeout Supervisor
//!
//! Runs one attempt of a job under its soft and hard deadlines.
//!
//! ```text
//! Running ──(soft)──▶ Degrading ──(done)──▶ Completed
//!    │                    │
//!    └──────(hard)────────┴──▶ TimedOut        (executor future dropped)
//!                         └──▶ VerifiedByPlatform / extended   (Ship verifying)
//! ```
//!
//! At the soft deadline the executor's wind-down token is cancelled and the observer is
//! told, so it can checkpoint a provisional handoff. The job keeps running.
//!
//! At the hard deadline the executor future is dropped, which kills any child process
//! spawned with `kill_on_drop`. The exception is a Ship job inside its verification
//! window: the deployment platform is asked for status first.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::domain::deployment::{DeploymentPlatform, DeploymentStatus};
use crate::domain::executor::{ExecutionContext, ExecutionSummary, Executor, ExecutorError};
use crate::domain::job::{Job, JobId, JobKind};
use crate::domain::timeout::{TimeoutPolicy, VerificationPolicy};

/// Upper bound for a single platform status probe at the hard deadline.
const STATUS_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait SupervisorObserver: Send + Sync {
    async fn on_soft_deadline(&self, job_id: JobId);
    async fn on_verification_extended(&self, job_id: JobId, extension: u32, extra: Duration);
}

#[derive(Debug)]
pub enum SupervisedOutcome {
    Completed(Result<ExecutionSummary, ExecutorError>),
    TimedOut {
        /// The soft deadline had already passed.
        degraded: bool,
        /// Effective hard limit, including verification extensions.
        limit: Duration,
    },
    /// Hard deadline hit during verification, but the platform reports healthy.
    VerifiedByPlatform,
}

pub struct Supervisor {
    executor: Arc<dyn Executor>,
    platform: Option<Arc<dyn DeploymentPlatform>>,
    verification: VerificationPolicy,
}

impl Supervisor {
    pub fn new(
        executor: Arc<dyn Executor>,
        platform: Option<Arc<dyn DeploymentPlatform>>,
        verification: VerificationPolicy,
    ) -> Self {
        Self {
            executor,
            platform,
            verification,
        }
    }

    pub async fn run(
        &self,
        ctx: ExecutionContext,
        job: Job,
        timeout: TimeoutPolicy,
        observer: Arc<dyn SupervisorObserver>,
    ) -> SupervisedOutcome {
        let job_id = job.id;
        let started = Instant::now();
        let soft_at = started + timeout.soft;
        let mut hard_at = started + timeout.hard;
        let mut degraded = false;
        let mut extensions = 0u32;

        let verifying_ship = job.kind == JobKind::Ship;
        let execution = self.executor.execute(ctx.clone(), job.clone());
        tokio::pin!(execution);

        loop {
            tokio::select! {
                biased;

                result = &mut execution => {
                    return SupervisedOutcome::Completed(result);
                }

                _ = sleep_until(soft_at), if !degraded => {
                    degraded = true;
                    info!(job_id = %job_id, "Soft deadline reached, winding down");
                    ctx.request_wind_down();
                    observer.on_soft_deadline(job_id).await;
                }

                _ = sleep_until(hard_at) => {
                    if verifying_ship && ctx.is_verifying() {
                        match self.probe_platform(&job).await {
                            Some(DeploymentStatus::Healthy) => {
                                info!(job_id = %job_id, "Deployment verified healthy at hard deadline");
                                return SupervisedOutcome::VerifiedByPlatform;
                            }
                            Some(DeploymentStatus::InProgress)
                                if extensions < self.verification.max_extensions =>
                            {
                                extensions += 1;
                                hard_at += self.verification.extension;
                                info!(
                                    job_id = %job_id,
                                    extension = extensions,
                                    "Deployment still verifying, extending hard deadline"
                                );
                                observer
                                    .on_verification_extended(job_id, extensions, self.verification.extension)
                                    .await;
                                continue;
                            }
                            status => {
                                warn!(job_id = %job_id, ?status, "Verification did not settle before the hard deadline");
                            }
                        }
                    }

                    warn!(job_id = %job_id, "Hard deadline reached, halting executor");
                    return SupervisedOutcome::TimedOut {
                        degraded,
                        limit: hard_at - started,
                    };
                }
            }
        }
    }

    async fn probe_platform(&self, job: &Job) -> Option<DeploymentStatus> {
        let platform = self.platform.as_ref()?;
        match tokio::time::timeout(STATUS_PROBE_TIMEOUT, platform.status(job)).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(job_id = %job.id, "Deployment status probe failed: {}", e);
                None
            }
            Err(_) => {
                warn!(job_id = %job.id, "Deployment status probe timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deployment::PlatformError;
    use crate::domain::job::JobRequest;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingObserver {
        soft: AtomicUsize,
        extensions: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl SupervisorObserver for RecordingObserver {
        async fn on_soft_deadline(&self, _job_id: JobId) {
            self.soft.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_verification_extended(&self, _job_id: JobId, extension: u32, _extra: Duration) {
            self.extensions.lock().push(extension);
        }
    }

    /// Works in 1-minute steps, checking the wind-down gate between steps.
    struct SteppingExecutor {
        steps: u32,
        verify: bool,
    }

    #[async_trait]
    impl Executor for SteppingExecutor {
        async fn execute(&self, ctx: ExecutionContext, _job: Job) -> Result<ExecutionSummary, ExecutorError> {
            if self.verify {
                ctx.enter_verification();
            }
            let mut done = 0;
            while done < self.steps && ctx.may_start_step() {
                tokio::time::sleep(Duration::from_secs(60)).await;
                done += 1;
            }
            Ok(ExecutionSummary {
                next_steps: (done..self.steps).map(|i| format!("step {}", i + 1)).collect(),
                build_status: None,
            })
        }
    }

    struct HangingExecutor;

    #[async_trait]
    impl Executor for HangingExecutor {
        async fn execute(&self, _ctx: ExecutionContext, _job: Job) -> Result<ExecutionSummary, ExecutorError> {
            std::future::pending().await
        }
    }

    struct ScriptedPlatform(Mutex<Vec<DeploymentStatus>>);

    #[async_trait]
    impl DeploymentPlatform for ScriptedPlatform {
        async fn status(&self, _job: &Job) -> Result<DeploymentStatus, PlatformError> {
            let mut script = self.0.lock();
            Ok(if script.is_empty() { DeploymentStatus::Unknown } else { script.remove(0) })
        }

        async fn rollback(&self, _job: &Job) -> Result<String, PlatformError> {
            Ok("rolled back".into())
        }
    }

    fn job(kind: JobKind) -> Job {
        Job::new(JobId::new(), JobRequest::new(kind, ["app"]))
    }

    fn minutes(soft: u64, hard: u64) -> TimeoutPolicy {
        TimeoutPolicy::new(Duration::from_secs(soft * 60), Duration::from_secs(hard * 60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_deadline_winds_down_without_failing() {
        let supervisor = Supervisor::new(
            Arc::new(SteppingExecutor { steps: 10, verify: false }),
            None,
            VerificationPolicy::default(),
        );
        let observer = Arc::new(RecordingObserver::default());
        let job = job(JobKind::Style);
        let ctx = ExecutionContext::detached(job.id);

        let outcome = supervisor.run(ctx, job, minutes(3, 8), observer.clone()).await;

        match outcome {
            SupervisedOutcome::Completed(Ok(summary)) => {
                assert!(!summary.next_steps.is_empty());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(observer.soft.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_deadline_halts_executor() {
        let supervisor = Supervisor::new(Arc::new(HangingExecutor), None, VerificationPolicy::default());
        let job = job(JobKind::Fix);
        let ctx = ExecutionContext::detached(job.id);
        let outcome = supervisor
            .run(ctx, job, minutes(1, 2), Arc::new(RecordingObserver::default()))
            .await;

        match outcome {
            SupervisedOutcome::TimedOut { degraded, limit } => {
                assert!(degraded);
                assert_eq!(limit, Duration::from_secs(120));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_verifying_ship_is_extended_then_verified() {
        struct VerifyingHang;

        #[async_trait]
        impl Executor for VerifyingHang {
            async fn execute(&self, ctx: ExecutionContext, _job: Job) -> Result<ExecutionSummary, ExecutorError> {
                ctx.enter_verification();
                std::future::pending().await
            }
        }

        let platform = Arc::new(ScriptedPlatform(Mutex::new(vec![
            DeploymentStatus::InProgress,
            DeploymentStatus::Healthy,
        ])));
        let supervisor = Supervisor::new(Arc::new(VerifyingHang), Some(platform), VerificationPolicy::default());
        let observer = Arc::new(RecordingObserver::default());
        let job = job(JobKind::Ship);
        let ctx = ExecutionContext::detached(job.id);

        let outcome = supervisor.run(ctx, job, minutes(5, 10), observer.clone()).await;

        assert!(matches!(outcome, SupervisedOutcome::VerifiedByPlatform));
        assert_eq!(*observer.extensions.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_verifying_ship_times_out_blindly() {
        let platform = Arc::new(ScriptedPlatform(Mutex::new(vec![DeploymentStatus::Healthy])));
        let supervisor = Supervisor::new(Arc::new(HangingExecutor), Some(platform), VerificationPolicy::default());
        let job = job(JobKind::Ship);
        let ctx = ExecutionContext::detached(job.id);

        let outcome = supervisor
            .run(ctx, job, minutes(5, 10), Arc::new(RecordingObserver::default()))
            .await;
        assert!(matches!(outcome, SupervisedOutcome::TimedOut { .. }));
    }
}
