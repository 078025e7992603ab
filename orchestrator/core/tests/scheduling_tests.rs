// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end scheduling tests against a running coordinator.
//!
//! Every test runs on a paused tokio clock, so deadlines, backoff delays and executor
//! "work" advance deterministically. The scripted executor picks its behaviour from the
//! job's feature name and records overlapping resource use.

use async_trait::async_trait;
use baton_core::application::{Coordinator, CoordinatorDeps, CoordinatorHandle};
use baton_core::domain::config::SchedulerSettings;
use baton_core::domain::deployment::{DeploymentPlatform, DeploymentStatus, PlatformError};
use baton_core::domain::error::{JobError, SchedulerError};
use baton_core::domain::events::JobEvent;
use baton_core::domain::executor::{ExecutionContext, ExecutionSummary, Executor, ExecutorError};
use baton_core::domain::handoff::{FileChange, HandoffContext, JobOutcome};
use baton_core::domain::job::{Job, JobId, JobKind, JobRequest, JobState};
use baton_core::domain::precondition::{InspectorError, WorkspaceInspector};
use baton_core::domain::repository::HandoffRepository;
use baton_core::infrastructure::event_bus::EventReceiver;
use baton_core::infrastructure::handoff_store::InMemoryHandoffRepository;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Clone)]
enum Script {
    /// Record a step, touch the first resource, succeed after the given time.
    Work(Duration),
    /// Never returns.
    Hang,
    /// 10-second steps, stopping early on wind-down.
    Steps(u32),
    /// Plan `steps`, complete the first `done`, then fail with a permission error.
    PartialThenDenied { steps: Vec<&'static str>, done: usize },
}

#[derive(Default)]
struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    failures: Mutex<HashMap<String, VecDeque<ExecutorError>>>,
    active: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
    predecessors: Mutex<HashMap<JobId, Option<HandoffContext>>>,
}

impl ScriptedExecutor {
    fn script(self: &Arc<Self>, feature: &str, script: Script) -> Arc<Self> {
        self.scripts.lock().insert(feature.to_string(), script);
        self.clone()
    }

    fn fail(self: &Arc<Self>, feature: &str, errors: Vec<ExecutorError>) -> Arc<Self> {
        self.failures.lock().insert(feature.to_string(), errors.into());
        self.clone()
    }

    fn predecessor_of(&self, id: JobId) -> Option<HandoffContext> {
        self.predecessors.lock().get(&id).cloned().flatten()
    }
}

/// Releases the claimed resources even when the executor future is dropped.
struct Claim<'a> {
    active: &'a Mutex<HashSet<String>>,
    resources: Vec<String>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        for resource in &self.resources {
            active.remove(resource);
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, ctx: ExecutionContext, job: Job) -> Result<ExecutionSummary, ExecutorError> {
        let feature = job.feature.clone().unwrap_or_default();
        self.predecessors.lock().insert(job.id, ctx.predecessor.clone());

        let resources: Vec<String> = job.resources().iter().cloned().collect();
        {
            let mut active = self.active.lock();
            for resource in &resources {
                if !active.insert(resource.clone()) {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let _claim = Claim {
            active: &self.active,
            resources: resources.clone(),
        };

        let failure = self.failures.lock().get_mut(&feature).and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            ctx.record_step(format!("attempt {}", ctx.attempt));
            return Err(error);
        }

        let script = self
            .scripts
            .lock()
            .get(&feature)
            .cloned()
            .unwrap_or(Script::Work(Duration::from_secs(1)));
        match script {
            Script::Work(duration) => {
                ctx.record_step("started");
                if let Some(first) = resources.first() {
                    ctx.record_file(first.clone(), FileChange::Modified);
                }
                tokio::time::sleep(duration).await;
                Ok(ExecutionSummary::default())
            }
            Script::Hang => std::future::pending().await,
            Script::Steps(total) => {
                let mut done = 0;
                while done < total && ctx.may_start_step() {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    done += 1;
                    ctx.record_step(format!("step {}", done));
                }
                Ok(ExecutionSummary {
                    next_steps: (done..total).map(|i| format!("step {}", i + 1)).collect(),
                    build_status: None,
                })
            }
            Script::PartialThenDenied { steps, done } => {
                ctx.set_next_steps(steps.iter().map(|s| s.to_string()).collect());
                for step in steps.iter().take(done) {
                    ctx.record_step(*step);
                }
                Err(ExecutorError::auth("403 Forbidden: token expired"))
            }
        }
    }
}

struct DirtyWorkspace;

#[async_trait]
impl WorkspaceInspector for DirtyWorkspace {
    async fn build_errors(&self) -> Result<Vec<String>, InspectorError> {
        Ok(Vec::new())
    }

    async fn uncommitted_changes(&self) -> Result<Vec<String>, InspectorError> {
        Ok(vec!["src/checkout.rs".to_string()])
    }
}

#[derive(Default)]
struct RestoringPlatform {
    rollbacks: AtomicUsize,
}

#[async_trait]
impl DeploymentPlatform for RestoringPlatform {
    async fn status(&self, _job: &Job) -> Result<DeploymentStatus, PlatformError> {
        Ok(DeploymentStatus::Failed("unhealthy".into()))
    }

    async fn rollback(&self, _job: &Job) -> Result<String, PlatformError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok("restored v41".into())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn start(executor: Arc<ScriptedExecutor>) -> CoordinatorHandle {
    Coordinator::start(SchedulerSettings::default(), CoordinatorDeps::new(executor))
}

fn request(kind: JobKind, resources: &[&str], feature: &str) -> JobRequest {
    JobRequest::new(kind, resources.iter().copied()).with_feature(feature)
}

/// Lets every task run until the whole runtime is idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn drain(receiver: &mut EventReceiver) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

fn started_order(events: &[JobEvent]) -> Vec<JobId> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::JobStarted { job_id, .. } => Some(*job_id),
            _ => None,
        })
        .collect()
}

fn deploy_failures(count: usize) -> Vec<ExecutorError> {
    (0..count).map(|_| ExecutorError::deploy("health check failed")).collect()
}

fn rollbacks_started(events: &[JobEvent]) -> Vec<JobId> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::RollbackStarted { job_id, .. } => Some(*job_id),
            _ => None,
        })
        .collect()
}

fn position(events: &[JobEvent], pred: impl Fn(&JobEvent) -> bool) -> usize {
    events
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("event not found in {:?}", events))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_overlapping_resources_are_mutually_exclusive() {
    let executor = Arc::new(ScriptedExecutor::default())
        .script("one", Script::Work(Duration::from_secs(30)))
        .script("two", Script::Work(Duration::from_secs(30)))
        .script("three", Script::Work(Duration::from_secs(30)));
    let handle = start(executor.clone());

    let one = handle.submit(request(JobKind::Fix, &["a.rs", "b.rs"], "one")).unwrap();
    let two = handle.submit(request(JobKind::Fix, &["b.rs", "c.rs"], "two")).unwrap();
    let three = handle.submit(request(JobKind::Fix, &["c.rs"], "three")).unwrap();
    settle().await;

    assert_eq!(handle.status(one).await.unwrap().state, JobState::Running);
    assert_eq!(handle.status(two).await.unwrap().state, JobState::Waiting);
    assert_eq!(handle.status(three).await.unwrap().state, JobState::Waiting);

    for id in [one, two, three] {
        assert_eq!(handle.wait_until_finished(id).await.unwrap().state, JobState::Succeeded);
    }
    assert_eq!(executor.overlaps.load(Ordering::SeqCst), 0);
    assert!(handle.locks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fix_dispatches_before_style_regardless_of_submission_order() {
    let handle = start(Arc::new(ScriptedExecutor::default()));
    let mut events = handle.event_bus().subscribe();

    let style = handle.submit(request(JobKind::Style, &["ui.css"], "style")).unwrap();
    let fix = handle.submit(request(JobKind::Fix, &["api.rs"], "fix")).unwrap();

    handle.wait_until_finished(style).await.unwrap();
    handle.wait_until_finished(fix).await.unwrap();
    assert_eq!(started_order(&drain(&mut events)), vec![fix, style]);
}

#[tokio::test(start_paused = true)]
async fn test_urgent_jumps_its_class_but_not_higher_kinds() {
    let handle = start(Arc::new(ScriptedExecutor::default()));
    let mut events = handle.event_bus().subscribe();

    let vibe = handle.submit(request(JobKind::Vibe, &["a.rs"], "vibe")).unwrap();
    let urgent_vibe = handle
        .submit(request(JobKind::Vibe, &["b.rs"], "urgent-vibe").urgent())
        .unwrap();
    let urgent_style = handle
        .submit(request(JobKind::Style, &["c.css"], "urgent-style").urgent())
        .unwrap();
    let fix = handle.submit(request(JobKind::Fix, &["d.rs"], "fix")).unwrap();

    for id in [vibe, urgent_vibe, urgent_style, fix] {
        handle.wait_until_finished(id).await.unwrap();
    }
    assert_eq!(
        started_order(&drain(&mut events)),
        vec![fix, urgent_vibe, vibe, urgent_style]
    );
}

#[tokio::test(start_paused = true)]
async fn test_network_error_retries_three_times_with_backoff_then_aborts() {
    let executor = Arc::new(ScriptedExecutor::default()).fail(
        "flaky",
        (0..4).map(|_| ExecutorError::new("connection reset by peer")).collect(),
    );
    let handle = start(executor);
    let mut events = handle.event_bus().subscribe();

    let id = handle.submit(request(JobKind::Fix, &["net.rs"], "flaky")).unwrap();
    let status = handle.wait_until_finished(id).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, 4);
    let delays: Vec<u64> = drain(&mut events)
        .iter()
        .filter_map(|e| match e {
            JobEvent::RetryScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1000, 2000, 4000]);

    let handoff = status.handoff.unwrap();
    assert_eq!(
        handoff.outcome().and_then(JobOutcome::error),
        Some(&JobError::Transient {
            message: "connection reset by peer".into(),
            attempts: 4,
        })
    );
    assert_eq!(handoff.completed_steps(), ["attempt 1", "attempt 2", "attempt 3", "attempt 4"]);
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_is_never_retried() {
    let executor = Arc::new(ScriptedExecutor::default()).fail("deploy-key", vec![ExecutorError::new("HTTP 401 Unauthorized")]);
    let handle = start(executor);
    let mut events = handle.event_bus().subscribe();

    let id = handle.submit(request(JobKind::Vibe, &["infra.tf"], "deploy-key")).unwrap();
    let status = handle.wait_until_finished(id).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, 1);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, JobEvent::RetryScheduled { .. })));
    let handoff = status.handoff.unwrap();
    assert!(handoff.blocking_issue().unwrap().starts_with("[auth]"));
    assert!(handoff.next_steps()[0].starts_with("manual intervention required"));
}

#[tokio::test(start_paused = true)]
async fn test_hard_timeout_releases_every_resource() {
    let executor = Arc::new(ScriptedExecutor::default()).script("stuck", Script::Hang);
    let mut settings = SchedulerSettings::default();
    settings.policy_mut(JobKind::Fix).timeout.soft = Duration::from_secs(60);
    settings.policy_mut(JobKind::Fix).timeout.hard = Duration::from_secs(120);
    let handle = Coordinator::start(settings, CoordinatorDeps::new(executor.clone()));

    let stuck = handle
        .submit(request(JobKind::Fix, &["a.rs", "b.rs", "c.rs"], "stuck"))
        .unwrap();
    let next = handle.submit(request(JobKind::Fix, &["c.rs"], "next")).unwrap();

    tokio::time::sleep(Duration::from_secs(61)).await;
    let degrading = handle.status(stuck).await.unwrap();
    assert_eq!(degrading.state, JobState::Running);
    assert!(degrading.degrading);
    assert_eq!(degrading.locks.len(), 3);
    assert!(!degrading.handoff.unwrap().is_final());

    let status = handle.wait_until_finished(stuck).await.unwrap();
    assert_eq!(status.state, JobState::TimedOut);
    assert!(status.locks.is_empty());
    let handoff = status.handoff.unwrap();
    assert_eq!(
        handoff.outcome().and_then(JobOutcome::error),
        Some(&JobError::Timeout {
            limit_secs: 120,
            degraded: true,
        })
    );
    assert!(handoff.blocking_issue().unwrap().starts_with("[timeout]"));

    assert_eq!(handle.wait_until_finished(next).await.unwrap().state, JobState::Succeeded);
    assert!(handle.locks().is_empty());
    assert_eq!(executor.overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ship_waits_while_vibe_holds_schema_definition() {
    let executor = Arc::new(ScriptedExecutor::default()).script("model", Script::Work(Duration::from_secs(60)));
    let handle = start(executor);
    let mut events = handle.event_bus().subscribe();

    let vibe = handle.submit(request(JobKind::Vibe, &["schema.def"], "model")).unwrap();
    settle().await;
    let ship = handle.submit(request(JobKind::Ship, &["deploy/prod"], "release")).unwrap();
    settle().await;

    let waiting = handle.status(ship).await.unwrap();
    assert_eq!(waiting.state, JobState::Waiting);
    assert!(waiting.locks.is_empty());

    assert_eq!(handle.wait_until_finished(ship).await.unwrap().state, JobState::Succeeded);
    let events = drain(&mut events);
    let vibe_done = position(&events, |e| matches!(e, JobEvent::JobFinished { job_id, .. } if *job_id == vibe));
    let ship_started = position(&events, |e| matches!(e, JobEvent::JobStarted { job_id, .. } if *job_id == ship));
    assert!(vibe_done < ship_started);
}

#[tokio::test(start_paused = true)]
async fn test_vibe_ceiling_keeps_third_job_queued() {
    let executor = Arc::new(ScriptedExecutor::default())
        .script("v1", Script::Work(Duration::from_secs(60)))
        .script("v2", Script::Work(Duration::from_secs(90)))
        .script("v3", Script::Work(Duration::from_secs(60)));
    let handle = start(executor);

    let v1 = handle.submit(request(JobKind::Vibe, &["a.rs"], "v1")).unwrap();
    let v2 = handle.submit(request(JobKind::Vibe, &["b.rs"], "v2")).unwrap();
    let v3 = handle.submit(request(JobKind::Vibe, &["c.rs"], "v3")).unwrap();
    settle().await;

    assert_eq!(handle.status(v1).await.unwrap().state, JobState::Running);
    assert_eq!(handle.status(v2).await.unwrap().state, JobState::Running);
    let third = handle.status(v3).await.unwrap();
    assert_eq!(third.state, JobState::Queued);
    assert_eq!(third.queue_position, Some(0));

    handle.wait_until_finished(v1).await.unwrap();
    settle().await;
    assert_eq!(handle.status(v3).await.unwrap().state, JobState::Running);
    assert_eq!(handle.status(v2).await.unwrap().state, JobState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_handoff_round_trip_and_transfer_to_next_feature_job() {
    let executor = Arc::new(ScriptedExecutor::default()).script(
        "login",
        Script::PartialThenDenied {
            steps: vec!["write form", "wire api", "add tests"],
            done: 1,
        },
    );
    let handle = start(executor.clone());

    let first = handle.submit(request(JobKind::Vibe, &["src/login.rs"], "login")).unwrap();
    let handoff = handle.wait_until_finished(first).await.unwrap().handoff.unwrap();

    let json = handoff.to_json_pretty().unwrap();
    let back = HandoffContext::from_json(&json).unwrap();
    assert_eq!(back, handoff);
    assert_eq!(back.completed_steps(), ["write form"]);
    assert_eq!(&back.next_steps()[1..], ["wire api", "add tests"]);
    assert!(back.blocking_issue().unwrap().contains("token expired"));

    executor.scripts.lock().remove("login");
    let second = handle.submit(request(JobKind::Fix, &["src/login.rs"], "login")).unwrap();
    handle.wait_until_finished(second).await.unwrap();
    let predecessor = executor.predecessor_of(second).unwrap();
    assert_eq!(predecessor.job_id(), first);
    assert_eq!(predecessor.completed_steps(), ["write form"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_precondition_rejects_without_running_or_locking() {
    let executor = Arc::new(ScriptedExecutor::default());
    let handle = Coordinator::start(
        SchedulerSettings::default(),
        CoordinatorDeps::new(executor).with_inspector(Arc::new(DirtyWorkspace)),
    );
    let mut events = handle.event_bus().subscribe();

    let ship = handle.submit(request(JobKind::Ship, &["deploy/prod"], "release")).unwrap();
    let status = handle.wait_until_finished(ship).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, 0);
    assert!(status.started_at.is_none());
    let handoff = status.handoff.unwrap();
    assert!(handoff
        .blocking_issue()
        .unwrap()
        .contains("no_uncommitted_changes"));
    assert!(started_order(&drain(&mut events)).is_empty());
    assert!(handle.locks().is_empty());

    // fix jobs have no preconditions
    let fix = handle.submit(request(JobKind::Fix, &["src/checkout.rs"], "fix")).unwrap();
    assert_eq!(handle.wait_until_finished(fix).await.unwrap().state, JobState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_rules() {
    let executor = Arc::new(ScriptedExecutor::default()).script("long", Script::Work(Duration::from_secs(60)));
    let handle = start(executor);

    let running = handle.submit(request(JobKind::Fix, &["a.rs"], "long")).unwrap();
    let waiting = handle.submit(request(JobKind::Fix, &["a.rs"], "short")).unwrap();
    settle().await;

    assert_eq!(handle.cancel(running).await, Err(SchedulerError::JobAlreadyRunning(running)));
    assert_eq!(
        handle.cancel(running).await.unwrap_err().to_string(),
        "job already running"
    );
    handle.cancel(waiting).await.unwrap();

    let cancelled = handle.status(waiting).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(cancelled.handoff.unwrap().blocking_issue().unwrap().starts_with("cancelled before start"));
    assert_eq!(
        handle.cancel(waiting).await,
        Err(SchedulerError::JobAlreadyFinished {
            id: waiting,
            state: JobState::Cancelled,
        })
    );

    let unknown = JobId::new();
    assert_eq!(handle.cancel(unknown).await, Err(SchedulerError::JobNotFound(unknown)));
    assert_eq!(handle.wait_until_finished(running).await.unwrap().state, JobState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_fix_preempts_waiting_style_job() {
    let executor = Arc::new(ScriptedExecutor::default()).script("holder", Script::Work(Duration::from_secs(60)));
    let handle = start(executor.clone());
    let mut events = handle.event_bus().subscribe();

    let holder = handle.submit(request(JobKind::Fix, &["theme.css"], "holder")).unwrap();
    settle().await;
    let style = handle.submit(request(JobKind::Style, &["theme.css"], "polish")).unwrap();
    settle().await;
    let fix = handle.submit(request(JobKind::Fix, &["theme.css"], "hotfix")).unwrap();
    settle().await;
    assert_eq!(handle.status(style).await.unwrap().state, JobState::Waiting);
    assert_eq!(handle.status(fix).await.unwrap().state, JobState::Waiting);

    for id in [holder, fix, style] {
        assert_eq!(handle.wait_until_finished(id).await.unwrap().state, JobState::Succeeded);
    }
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        JobEvent::JobPreempted { job_id, preempted_by, .. } if *job_id == style && *preempted_by == fix
    )));
    assert_eq!(started_order(&events), vec![holder, fix, style]);
    assert_eq!(executor.overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deploy_failure_rolls_back_and_admits_corrective_fix() {
    let executor = Arc::new(ScriptedExecutor::default()).fail("release", deploy_failures(2));
    let platform = Arc::new(RestoringPlatform::default());
    let handle = Coordinator::start(
        SchedulerSettings::default(),
        CoordinatorDeps::new(executor.clone()).with_platform(platform.clone()),
    );

    let ship = handle.submit(request(JobKind::Ship, &["deploy/prod"], "release")).unwrap();
    let status = handle.wait_until_finished(ship).await.unwrap();

    assert_eq!(status.state, JobState::RolledBack);
    assert_eq!(status.attempt, 2);
    assert!(status.locks.is_empty());
    let handoff = status.handoff.clone().unwrap();
    match handoff.outcome() {
        Some(JobOutcome::RolledBack { rollback, error }) => {
            assert_eq!(rollback, "restored v41");
            assert_eq!(error.class_name(), "deploy");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let corrective = handle
        .list()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.corrective_of == Some(ship))
        .expect("corrective job admitted");
    assert_eq!(corrective.kind, JobKind::Fix);
    assert!(corrective.urgent);
    assert_eq!(corrective.resources, status.resources);
    assert_eq!(
        handoff.next_steps()[1],
        format!("corrective fix job {} admitted", corrective.job_id)
    );

    let fixed = handle.wait_until_finished(corrective.job_id).await.unwrap();
    assert_eq!(fixed.state, JobState::Succeeded);
    assert_eq!(executor.predecessor_of(corrective.job_id).map(|h| h.job_id()), Some(ship));
    assert_eq!(platform.rollbacks.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failing_corrective_fix_ends_the_chain() {
    // the ship job and its corrective fix share the feature, so both draw from this queue
    let executor = Arc::new(ScriptedExecutor::default()).fail("release", deploy_failures(8));
    let platform = Arc::new(RestoringPlatform::default());
    let handle = Coordinator::start(
        SchedulerSettings::default(),
        CoordinatorDeps::new(executor).with_platform(platform.clone()),
    );
    let mut events = handle.event_bus().subscribe();

    let ship = handle.submit(request(JobKind::Ship, &["deploy/prod"], "release")).unwrap();
    assert_eq!(handle.wait_until_finished(ship).await.unwrap().state, JobState::RolledBack);
    let corrective = handle
        .list()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.corrective_of == Some(ship))
        .expect("corrective job admitted");

    let fixed = handle.wait_until_finished(corrective.job_id).await.unwrap();
    assert_eq!(fixed.state, JobState::Failed);
    assert_eq!(fixed.attempt, 2);
    settle().await;

    assert_eq!(handle.list().await.unwrap().len(), 2);
    assert_eq!(platform.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(rollbacks_started(&drain(&mut events)), vec![ship]);
}

#[tokio::test(start_paused = true)]
async fn test_deploy_errors_outside_ship_jobs_never_roll_back() {
    let executor = Arc::new(ScriptedExecutor::default()).fail("schema-tweak", deploy_failures(2));
    let platform = Arc::new(RestoringPlatform::default());
    let handle = Coordinator::start(
        SchedulerSettings::default(),
        CoordinatorDeps::new(executor).with_platform(platform.clone()),
    );
    let mut events = handle.event_bus().subscribe();

    let vibe = handle.submit(request(JobKind::Vibe, &["src/api.rs"], "schema-tweak")).unwrap();
    let status = handle.wait_until_finished(vibe).await.unwrap();
    settle().await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, 2);
    assert_eq!(
        status.handoff.unwrap().outcome().and_then(JobOutcome::error).map(JobError::class_name),
        Some("deploy")
    );
    assert_eq!(platform.rollbacks.load(Ordering::SeqCst), 0);
    assert!(rollbacks_started(&drain(&mut events)).is_empty());
    assert_eq!(handle.list().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_without_corrective_job_asks_for_manual_intervention() {
    let executor = Arc::new(ScriptedExecutor::default()).fail("release", deploy_failures(2));
    let mut settings = SchedulerSettings::default();
    settings.rollback_corrective_job = false;
    let handle = Coordinator::start(
        settings,
        CoordinatorDeps::new(executor).with_platform(Arc::new(RestoringPlatform::default())),
    );

    let ship = handle.submit(request(JobKind::Ship, &["deploy/prod"], "release")).unwrap();
    let status = handle.wait_until_finished(ship).await.unwrap();
    settle().await;

    assert_eq!(status.state, JobState::RolledBack);
    let handoff = status.handoff.unwrap();
    assert!(handoff
        .next_steps()
        .iter()
        .any(|step| step == "manual intervention required: no corrective fix job was admitted"));
    assert_eq!(handle.list().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_earlier_waiter_acquires_before_higher_priority_later_waiter() {
    let executor = Arc::new(ScriptedExecutor::default()).script("holder", Script::Work(Duration::from_secs(60)));
    let handle = start(executor.clone());
    let mut events = handle.event_bus().subscribe();

    let holder = handle.submit(request(JobKind::Fix, &["shared.rs"], "holder")).unwrap();
    settle().await;
    let style = handle.submit(request(JobKind::Style, &["shared.rs"], "tidy")).unwrap();
    settle().await;
    let vibe = handle.submit(request(JobKind::Vibe, &["shared.rs"], "rework")).unwrap();
    settle().await;
    assert_eq!(handle.status(style).await.unwrap().state, JobState::Waiting);
    assert_eq!(handle.status(vibe).await.unwrap().state, JobState::Waiting);

    for id in [holder, style, vibe] {
        assert_eq!(handle.wait_until_finished(id).await.unwrap().state, JobState::Succeeded);
    }
    assert_eq!(started_order(&drain(&mut events)), vec![holder, style, vibe]);
    assert_eq!(executor.overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_finished_jobs_beyond_retention_are_forgotten() {
    let repository = Arc::new(InMemoryHandoffRepository::new());
    let mut settings = SchedulerSettings::default();
    settings.finished_job_retention = 2;
    let handle = Coordinator::start(
        settings,
        CoordinatorDeps::new(Arc::new(ScriptedExecutor::default())).with_handoffs(repository.clone()),
    );

    let mut ids = Vec::new();
    for (resource, feature) in [("a.rs", "first"), ("b.rs", "second"), ("c.rs", "third")] {
        let id = handle.submit(request(JobKind::Fix, &[resource], feature)).unwrap();
        assert_eq!(handle.wait_until_finished(id).await.unwrap().state, JobState::Succeeded);
        ids.push(id);
    }
    settle().await;

    assert_eq!(handle.status(ids[0]).await.unwrap_err(), SchedulerError::JobNotFound(ids[0]));
    let listed: Vec<JobId> = handle.list().await.unwrap().into_iter().map(|s| s.job_id).collect();
    assert_eq!(listed, vec![ids[1], ids[2]]);
    assert!(repository.find_by_job(ids[0]).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_and_winds_down_running() {
    let executor = Arc::new(ScriptedExecutor::default()).script("long", Script::Steps(30));
    let repository = Arc::new(InMemoryHandoffRepository::new());
    let handle = Coordinator::start(
        SchedulerSettings::default(),
        CoordinatorDeps::new(executor).with_handoffs(repository.clone()),
    );

    let running = handle.submit(request(JobKind::Fix, &["a.rs"], "long")).unwrap();
    let pending = handle.submit(request(JobKind::Fix, &["a.rs"], "after")).unwrap();
    tokio::time::sleep(Duration::from_secs(25)).await;

    handle.shutdown().await;

    assert!(handle.is_stopped());
    assert_eq!(handle.status(running).await.unwrap_err(), SchedulerError::CoordinatorStopped);
    assert!(handle.submit(request(JobKind::Fix, &["b.rs"], "late")).is_err());

    let finished = repository.find_by_job(running).await.unwrap().unwrap();
    assert_eq!(finished.outcome(), Some(&JobOutcome::Succeeded));
    assert_eq!(finished.completed_steps(), ["step 1", "step 2", "step 3"]);
    assert_eq!(finished.next_steps().len(), 27);

    let cancelled = repository.find_by_job(pending).await.unwrap().unwrap();
    assert_eq!(cancelled.outcome().map(JobOutcome::state), Some(JobState::Cancelled));
}

#[tokio::test]
async fn test_submit_rejects_blank_resource_names() {
    let handle = start(Arc::new(ScriptedExecutor::default()));
    let err = handle
        .submit(JobRequest::new(JobKind::Fix, ["  "]))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    handle.shutdown().await;
}
