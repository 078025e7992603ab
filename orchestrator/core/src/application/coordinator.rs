// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Job Coordinator Application Service
//!
//! A single tokio task owns every piece of mutable scheduling state: the queue, the job
//! records, retry bookkeeping and handoff builders. Callers talk to it through a cloneable
//! [`CoordinatorHandle`]; running jobs talk to it through an internal channel.
//!
//! ```text
//!  handle ──Command──▶ ┌─────────────┐ ──spawn──▶ supervisor + executor (one task per run)
//!                      │ Coordinator │ ◀─Internal── progress / deadlines / finished
//!  bus ◀──JobEvent──── └─────────────┘ ──handoff──▶ HandoffPersister ──▶ repository
//! ```
//!
//! ## Dispatch
//!
//! After every message the coordinator walks the queue in priority order and, for each
//! candidate, checks in turn:
//!
//! 1. retry backoff and in-flight precondition checks (skipped)
//! 2. the per-kind concurrency ceiling (stays `Queued`)
//! 3. Ship jobs: no running Vibe job may hold a schema resource (`Waiting`)
//! 4. resources locked by a running job or reserved by a precondition check (`Waiting`)
//! 5. waiting jobs with an earlier wait ticket sharing a resource (`Waiting`), except that
//!    a Fix job re-queues waiting Style jobs in its way
//! 6. preconditions, on the first attempt only, with the resources reserved but unlocked
//!
//! and finally acquires every lock at once and starts the job under the supervisor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::application::handoff_persister::{HandoffPersister, HandoffSink};
use crate::domain::config::SchedulerSettings;
use crate::domain::deployment::{DeploymentPlatform, PlatformError};
use crate::domain::error::{JobError, SchedulerError};
use crate::domain::events::JobEvent;
use crate::domain::executor::{ExecutionContext, Executor, ExecutorError, ProgressReport, ProgressSink};
use crate::domain::handoff::{HandoffBuilder, HandoffContext, JobOutcome};
use crate::domain::job::{normalize_resources, Job, JobId, JobKind, JobRequest, JobState};
use crate::domain::lock::{AcquireOutcome, ResourceLock, ResourceLockManager};
use crate::domain::precondition::{check_preconditions, Precondition, WorkspaceInspector};
use crate::domain::queue::JobQueue;
use crate::domain::repository::HandoffRepository;
use crate::domain::retry::{ErrorClass, RetryDecision, RetryPolicy, RetryState};
use crate::domain::supervisor::{SupervisedOutcome, Supervisor, SupervisorObserver};
use crate::domain::timeout::TimeoutPolicy;
use crate::infrastructure::event_bus::{EventBus, EventBusError};
use crate::infrastructure::handoff_store::InMemoryHandoffRepository;
use crate::infrastructure::metrics;

const SHUTDOWN_REASON: &str = "coordinator shutting down";

// ============================================================================
// Public API
// ============================================================================

/// Snapshot of a job as reported by `status` and `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub resources: BTreeSet<String>,
    pub urgent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    pub attempt: u32,
    /// Zero-based dispatch position while pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    /// The soft deadline has passed and the executor is winding down.
    #[serde(default)]
    pub degrading: bool,
    /// Resources currently locked by this job.
    #[serde(default)]
    pub locks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrective_of: Option<JobId>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Finalized handoff once terminal; a provisional snapshot while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<HandoffContext>,
}

/// Collaborators injected into the coordinator.
pub struct CoordinatorDeps {
    executor: Arc<dyn Executor>,
    inspector: Option<Arc<dyn WorkspaceInspector>>,
    platform: Option<Arc<dyn DeploymentPlatform>>,
    handoffs: Arc<dyn HandoffRepository>,
    event_bus: EventBus,
}

impl CoordinatorDeps {
    /// In-memory handoff store, a fresh event bus, no preconditions, no deployment platform.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            inspector: None,
            platform: None,
            handoffs: Arc::new(InMemoryHandoffRepository::new()),
            event_bus: EventBus::with_default_capacity(),
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn WorkspaceInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn DeploymentPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_handoffs(mut self, handoffs: Arc<dyn HandoffRepository>) -> Self {
        self.handoffs = handoffs;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }
}

/// Cloneable front door to the coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
    event_bus: EventBus,
    locks: Arc<ResourceLockManager>,
}

impl CoordinatorHandle {
    /// Admits a job. Never blocks: the id is minted here and the job is posted to the
    /// coordinator.
    pub fn submit(&self, request: JobRequest) -> Result<JobId, SchedulerError> {
        let resources = normalize_resources(&request.resources).map_err(SchedulerError::InvalidRequest)?;
        if let Some(feature) = &request.feature {
            if feature.trim().is_empty() {
                return Err(SchedulerError::InvalidRequest("feature must not be empty".to_string()));
            }
        }
        let id = JobId::new();
        let request = JobRequest { resources, ..request };
        self.tx
            .send(Command::Submit { id, request })
            .map_err(|_| SchedulerError::CoordinatorStopped)?;
        Ok(id)
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatus, SchedulerError> {
        self.request(|reply| Command::Status { id, reply }).await?
    }

    /// Every job known to this coordinator, in submission order.
    pub async fn list(&self) -> Result<Vec<JobStatus>, SchedulerError> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Cancels a queued or waiting job. Running jobs can only end through their deadlines.
    pub async fn cancel(&self, id: JobId) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    /// Resolves once the job is terminal.
    pub async fn wait_until_finished(&self, id: JobId) -> Result<JobStatus, SchedulerError> {
        // subscribe before the first status query so the finish event cannot slip past
        let mut events = self.event_bus.subscribe_job(id);
        loop {
            let status = self.status(id).await?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.is_terminal() => break,
                    Ok(_) => continue,
                    Err(EventBusError::Lagged(_)) => break,
                    Err(_) => return Err(SchedulerError::CoordinatorStopped),
                }
            }
        }
    }

    /// Cancels pending jobs, lets running jobs wind down and waits for the coordinator
    /// to exit. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn locks(&self) -> Vec<ResourceLock> {
        self.locks.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| SchedulerError::CoordinatorStopped)?;
        rx.await.map_err(|_| SchedulerError::CoordinatorStopped)
    }
}

// ============================================================================
// Messages
// ============================================================================

enum Command {
    Submit {
        id: JobId,
        request: JobRequest,
    },
    Status {
        id: JobId,
        reply: oneshot::Sender<Result<JobStatus, SchedulerError>>,
    },
    List {
        reply: oneshot::Sender<Vec<JobStatus>>,
    },
    Cancel {
        id: JobId,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    Progress {
        job_id: JobId,
        attempt: u32,
        report: ProgressReport,
    },
    SoftDeadline {
        job_id: JobId,
    },
    VerificationExtended {
        job_id: JobId,
        extension: u32,
        extra: Duration,
    },
    PreconditionsChecked {
        job_id: JobId,
        result: Result<(), JobError>,
    },
    Finished {
        job_id: JobId,
        attempt: u32,
        outcome: SupervisedOutcome,
    },
    RollbackFinished {
        job_id: JobId,
        result: Result<String, PlatformError>,
    },
    BackoffElapsed {
        job_id: JobId,
    },
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Internal>,
}

impl ProgressSink for ChannelSink {
    fn report(&self, job_id: JobId, attempt: u32, report: ProgressReport) {
        let _ = self.tx.send(Internal::Progress {
            job_id,
            attempt,
            report,
        });
    }
}

struct ChannelObserver {
    tx: mpsc::UnboundedSender<Internal>,
}

#[async_trait]
impl SupervisorObserver for ChannelObserver {
    async fn on_soft_deadline(&self, job_id: JobId) {
        let _ = self.tx.send(Internal::SoftDeadline { job_id });
    }

    async fn on_verification_extended(&self, job_id: JobId, extension: u32, extra: Duration) {
        let _ = self.tx.send(Internal::VerificationExtended {
            job_id,
            extension,
            extra,
        });
    }
}

// ============================================================================
// Coordinator task
// ============================================================================

struct JobEntry {
    job: Job,
    /// Present until the job is finalized.
    builder: Option<HandoffBuilder>,
    handoff: Option<HandoffContext>,
    retry: Option<RetryState>,
    /// Wait ticket, drawn when the job first has to wait. Lower tickets go first.
    ticket: Option<u64>,
    /// A precondition check is in flight; the job's resources are reserved.
    validating: bool,
    preconditions_passed: bool,
    rolling_back: bool,
    /// Error that ended the run being rolled back.
    rollback_error: Option<JobError>,
    degrading: bool,
    last_error: Option<String>,
    ctx: Option<ExecutionContext>,
    run_started: Option<Instant>,
}

impl JobEntry {
    fn new(job: Job) -> Self {
        let builder = HandoffBuilder::new(&job);
        Self {
            job,
            builder: Some(builder),
            handoff: None,
            retry: None,
            ticket: None,
            validating: false,
            preconditions_passed: false,
            rolling_back: false,
            rollback_error: None,
            degrading: false,
            last_error: None,
            ctx: None,
            run_started: None,
        }
    }

    fn in_backoff(&self, now: Instant) -> bool {
        self.retry
            .as_ref()
            .and_then(|r| r.backoff_until)
            .is_some_and(|until| until > now)
    }

    /// Counts against the kind's concurrency ceiling.
    fn is_active(&self) -> bool {
        self.job.state == JobState::Running || self.validating
    }
}

pub struct Coordinator {
    settings: SchedulerSettings,
    retry: RetryPolicy,
    locks: Arc<ResourceLockManager>,
    queue: JobQueue,
    jobs: HashMap<JobId, JobEntry>,
    submission_order: Vec<JobId>,
    /// Terminal jobs in the order they finished, oldest first.
    finished_order: VecDeque<JobId>,
    next_ticket: u64,
    /// Latest finalized handoff per feature produced by this coordinator.
    feature_handoffs: HashMap<String, HandoffContext>,
    supervisor: Arc<Supervisor>,
    inspector: Option<Arc<dyn WorkspaceInspector>>,
    platform: Option<Arc<dyn DeploymentPlatform>>,
    handoffs: Arc<dyn HandoffRepository>,
    persist: HandoffSink,
    persister_task: JoinHandle<()>,
    event_bus: EventBus,
    internal_tx: mpsc::UnboundedSender<Internal>,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Coordinator {
    /// Spawns the coordinator task. Must be called from within a tokio runtime.
    pub fn start(settings: SchedulerSettings, deps: CoordinatorDeps) -> CoordinatorHandle {
        let (tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let locks = Arc::new(ResourceLockManager::new());
        let (persist, persister_task) = HandoffPersister::new(deps.handoffs.clone()).start();

        let supervisor = Arc::new(Supervisor::new(
            deps.executor,
            deps.platform.clone(),
            settings.verification,
        ));

        let coordinator = Coordinator {
            retry: RetryPolicy::new(settings.retry.clone()),
            queue: JobQueue::new(settings.priority.clone()),
            settings,
            locks: locks.clone(),
            jobs: HashMap::new(),
            submission_order: Vec::new(),
            finished_order: VecDeque::new(),
            next_ticket: 0,
            feature_handoffs: HashMap::new(),
            supervisor,
            inspector: deps.inspector,
            platform: deps.platform,
            handoffs: deps.handoffs,
            persist,
            persister_task,
            event_bus: deps.event_bus.clone(),
            internal_tx,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
        };

        info!("Starting job coordinator");
        tokio::spawn(coordinator.run(commands, internal));

        CoordinatorHandle {
            tx,
            event_bus: deps.event_bus,
            locks,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut handles_open = true;

        loop {
            tokio::select! {
                command = commands.recv(), if handles_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        handles_open = false;
                        debug!("All coordinator handles dropped");
                        self.begin_shutdown();
                    }
                },
                Some(message) = internal.recv() => self.handle_internal(message),
            }

            // drain everything already queued so one dispatch pass sees the whole batch
            loop {
                if handles_open {
                    match commands.try_recv() {
                        Ok(command) => {
                            self.handle_command(command);
                            continue;
                        }
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            handles_open = false;
                            self.begin_shutdown();
                            continue;
                        }
                        Err(mpsc::error::TryRecvError::Empty) => {}
                    }
                }
                match internal.try_recv() {
                    Ok(message) => self.handle_internal(message),
                    Err(_) => break,
                }
            }

            if self.shutting_down && !self.jobs.values().any(JobEntry::is_active) {
                break;
            }
            self.dispatch();
        }

        // handles observe the stop before any shutdown caller is released
        drop(commands);
        let waiters = std::mem::take(&mut self.shutdown_waiters);
        drop(self.persist);
        if let Err(e) = self.persister_task.await {
            warn!("Handoff persister task failed: {}", e);
        }
        info!(jobs = self.jobs.len(), "Job coordinator stopped");
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { id, request } => self.admit(id, request, None),
            Command::Status { id, reply } => {
                let status = self
                    .jobs
                    .get(&id)
                    .map(|entry| self.status_of(entry))
                    .ok_or(SchedulerError::JobNotFound(id));
                let _ = reply.send(status);
            }
            Command::List { reply } => {
                let all = self
                    .submission_order
                    .iter()
                    .filter_map(|id| self.jobs.get(id))
                    .map(|entry| self.status_of(entry))
                    .collect();
                let _ = reply.send(all);
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Shutdown { reply } => {
                self.shutdown_waiters.push(reply);
                self.begin_shutdown();
            }
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Progress {
                job_id,
                attempt,
                report,
            } => self.on_progress(job_id, attempt, report),
            Internal::SoftDeadline { job_id } => self.on_soft_deadline(job_id),
            Internal::VerificationExtended {
                job_id,
                extension,
                extra,
            } => {
                info!(job_id = %job_id, extension, "Verification window extended");
                let extended_until = Utc::now() + chrono::Duration::from_std(extra).unwrap_or_else(|_| chrono::Duration::zero());
                self.event_bus.publish(JobEvent::VerificationExtended {
                    job_id,
                    extension,
                    extended_until,
                });
            }
            Internal::PreconditionsChecked { job_id, result } => self.on_preconditions_checked(job_id, result),
            Internal::Finished {
                job_id,
                attempt,
                outcome,
            } => self.on_finished(job_id, attempt, outcome),
            Internal::RollbackFinished { job_id, result } => self.on_rollback_finished(job_id, result),
            Internal::BackoffElapsed { job_id } => {
                if let Some(retry) = self.jobs.get_mut(&job_id).and_then(|e| e.retry.as_mut()) {
                    retry.backoff_until = None;
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Admission, cancellation, shutdown
    // ------------------------------------------------------------------------

    fn admit(&mut self, id: JobId, request: JobRequest, corrective_of: Option<JobId>) {
        let mut job = Job::new(id, request);
        job.corrective_of = corrective_of;

        info!(
            job_id = %id,
            kind = %job.kind,
            urgent = job.urgent,
            resources = job.resources().len(),
            "Job submitted"
        );
        metrics::record_submitted(job.kind);
        self.event_bus.publish(JobEvent::JobSubmitted {
            job_id: id,
            kind: job.kind,
            resources: job.resources().clone(),
            urgent: job.urgent,
            submitted_at: job.submitted_at,
        });

        let (kind, urgent) = (job.kind, job.urgent);
        self.jobs.insert(id, JobEntry::new(job));
        self.submission_order.push(id);

        if self.shutting_down {
            self.cancel_pending(id, SHUTDOWN_REASON);
        } else {
            self.queue.push(id, kind, urgent);
        }
    }

    fn cancel(&mut self, id: JobId) -> Result<(), SchedulerError> {
        let state = self
            .jobs
            .get(&id)
            .map(|entry| entry.job.state)
            .ok_or(SchedulerError::JobNotFound(id))?;
        match state {
            JobState::Queued | JobState::Waiting => {
                self.cancel_pending(id, "cancelled on request");
                Ok(())
            }
            JobState::Running => Err(SchedulerError::JobAlreadyRunning(id)),
            state => Err(SchedulerError::JobAlreadyFinished { id, state }),
        }
    }

    fn cancel_pending(&mut self, id: JobId, reason: &str) {
        info!(job_id = %id, reason, "Cancelling pending job");
        self.finalize(
            id,
            JobOutcome::Cancelled {
                reason: reason.to_string(),
            },
        );
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        let pending: Vec<JobId> = self
            .submission_order
            .iter()
            .copied()
            .filter(|id| self.jobs.get(id).is_some_and(|e| e.job.state.is_pending()))
            .collect();
        let mut running = 0usize;
        for entry in self.jobs.values() {
            if let Some(ctx) = &entry.ctx {
                ctx.request_wind_down();
                running += 1;
            }
        }
        info!(
            pending = pending.len(),
            running, "Coordinator shutting down, winding down running jobs"
        );
        for id in pending {
            self.cancel_pending(id, SHUTDOWN_REASON);
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn dispatch(&mut self) {
        if self.shutting_down {
            return;
        }
        let now = Instant::now();
        let mut active: HashMap<JobKind, u32> = HashMap::new();
        for entry in self.jobs.values().filter(|e| e.is_active()) {
            *active.entry(entry.job.kind).or_default() += 1;
        }

        for id in self.queue.ordered() {
            let Some(entry) = self.jobs.get(&id) else {
                continue;
            };
            if entry.validating || entry.in_backoff(now) {
                continue;
            }
            let kind = entry.job.kind;
            let policy = self.settings.policy(kind);
            if let Some(limit) = policy.max_concurrent {
                if active.get(&kind).copied().unwrap_or(0) >= limit {
                    continue;
                }
            }
            let resources = entry.job.resources().clone();

            if kind == JobKind::Ship {
                let schema_holders = self.vibes_holding_schema();
                if !schema_holders.is_empty() {
                    self.mark_waiting(id, schema_holders, "schema resource locked by a running vibe job");
                    continue;
                }
            }

            let mut holders = self.locks.conflicts(id, &resources);
            holders.extend(self.reservations(id, &resources));
            if !holders.is_empty() {
                self.mark_waiting(id, holders, "resources held by another job");
                continue;
            }

            let earlier = self.earlier_waiters(id, &resources);
            if !earlier.is_empty() {
                let preemptible = kind == JobKind::Fix
                    && earlier
                        .iter()
                        .all(|w| self.jobs.get(w).is_some_and(|e| e.job.kind == JobKind::Style));
                if preemptible {
                    for style in earlier {
                        self.preempt(style, id);
                    }
                } else {
                    self.mark_waiting(id, earlier, "queued behind an earlier waiting job");
                    continue;
                }
            }

            let needs_check = self.inspector.is_some()
                && !policy.preconditions.is_empty()
                && self
                    .jobs
                    .get(&id)
                    .is_some_and(|e| e.job.attempt == 0 && !e.preconditions_passed);
            if needs_check {
                self.begin_validation(id, policy.preconditions);
                *active.entry(kind).or_default() += 1;
                continue;
            }

            match self.locks.try_acquire(id, &resources) {
                AcquireOutcome::Granted => {
                    self.start_job(id, policy.timeout);
                    *active.entry(kind).or_default() += 1;
                }
                AcquireOutcome::Conflict(holders) => {
                    self.mark_waiting(id, holders, "resources held by another job");
                }
            }
        }
    }

    fn vibes_holding_schema(&self) -> BTreeSet<JobId> {
        self.jobs
            .values()
            .filter(|e| e.job.kind == JobKind::Vibe && e.job.state == JobState::Running)
            .filter(|e| self.settings.schema.any_schema(&self.locks.held_by(e.job.id)))
            .map(|e| e.job.id)
            .collect()
    }

    /// Jobs whose precondition check has reserved any of `resources`.
    fn reservations(&self, id: JobId, resources: &BTreeSet<String>) -> BTreeSet<JobId> {
        self.jobs
            .values()
            .filter(|e| e.validating && e.job.id != id && e.job.touches_any(resources))
            .map(|e| e.job.id)
            .collect()
    }

    fn earlier_waiters(&self, id: JobId, resources: &BTreeSet<String>) -> BTreeSet<JobId> {
        let own = self
            .jobs
            .get(&id)
            .and_then(|e| e.ticket)
            .unwrap_or(u64::MAX);
        self.jobs
            .values()
            .filter(|e| e.job.id != id && e.job.state == JobState::Waiting && !e.validating)
            .filter(|e| e.ticket.is_some_and(|t| t < own) && e.job.touches_any(resources))
            .map(|e| e.job.id)
            .collect()
    }

    fn draw_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    fn mark_waiting(&mut self, id: JobId, blocked_by: BTreeSet<JobId>, reason: &str) {
        let ticket = self.draw_ticket();
        let Some(entry) = self.jobs.get_mut(&id) else {
            return;
        };
        if entry.job.state == JobState::Waiting {
            return;
        }
        entry.job.wait();
        entry.ticket.get_or_insert(ticket);
        debug!(job_id = %id, ticket = ?entry.ticket, reason, "Job waiting");
        self.event_bus.publish(JobEvent::JobWaiting {
            job_id: id,
            blocked_by: blocked_by.into_iter().collect(),
            reason: reason.to_string(),
        });
    }

    fn preempt(&mut self, style: JobId, by: JobId) {
        let Some(entry) = self.jobs.get_mut(&style) else {
            return;
        };
        entry.job.requeue();
        entry.ticket = None;
        let (kind, urgent) = (entry.job.kind, entry.job.urgent);
        self.queue.remove(style);
        self.queue.push(style, kind, urgent);

        info!(job_id = %style, preempted_by = %by, "Waiting style job re-queued for fix job");
        metrics::record_preemption();
        self.event_bus.publish(JobEvent::JobPreempted {
            job_id: style,
            preempted_by: by,
            preempted_at: Utc::now(),
        });
    }

    fn begin_validation(&mut self, id: JobId, preconditions: Vec<Precondition>) {
        let ticket = self.draw_ticket();
        let Some(inspector) = self.inspector.clone() else {
            return;
        };
        let Some(entry) = self.jobs.get_mut(&id) else {
            return;
        };
        entry.validating = true;
        // holds its place against jobs that start waiting while the check runs
        entry.ticket.get_or_insert(ticket);
        let job = entry.job.clone();
        debug!(job_id = %id, "Checking preconditions");

        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = check_preconditions(inspector.as_ref(), &job, &preconditions).await;
            let _ = tx.send(Internal::PreconditionsChecked { job_id: job.id, result });
        });
    }

    fn start_job(&mut self, id: JobId, timeout: TimeoutPolicy) {
        self.queue.remove(id);
        let predecessor = self.predecessor_for(id);
        let Some(entry) = self.jobs.get_mut(&id) else {
            return;
        };
        entry.job.start();
        entry.ticket = None;
        entry.degrading = false;
        entry.run_started = Some(Instant::now());
        let attempt = entry.job.attempt;
        if let Some(builder) = entry.builder.as_mut() {
            builder.set_attempts(attempt);
        }

        let sink = Arc::new(ChannelSink {
            tx: self.internal_tx.clone(),
        });
        let ctx = ExecutionContext::new(id, attempt, sink).with_previous_error(entry.last_error.clone());
        entry.ctx = Some(ctx.clone());
        let job = entry.job.clone();

        info!(job_id = %id, kind = %job.kind, attempt, "Job started");
        metrics::record_started(job.kind);
        self.event_bus.publish(JobEvent::JobStarted {
            job_id: id,
            kind: job.kind,
            attempt,
            started_at: job.started_at.unwrap_or_else(Utc::now),
        });

        let supervisor = self.supervisor.clone();
        let handoffs = self.handoffs.clone();
        let tx = self.internal_tx.clone();
        let observer = Arc::new(ChannelObserver { tx: tx.clone() });
        tokio::spawn(async move {
            let predecessor = match predecessor {
                Some(found) => Some(found),
                None => stored_predecessor(handoffs.as_ref(), &job).await,
            };
            let outcome = supervisor
                .run(ctx.with_predecessor(predecessor), job, timeout, observer)
                .await;
            let _ = tx.send(Internal::Finished {
                job_id: id,
                attempt,
                outcome,
            });
        });
    }

    fn predecessor_for(&self, id: JobId) -> Option<HandoffContext> {
        let job = &self.jobs.get(&id)?.job;
        if let Some(original) = job.corrective_of {
            return self.jobs.get(&original).and_then(|e| e.handoff.clone());
        }
        self.feature_handoffs.get(job.feature.as_deref()?).cloned()
    }

    // ------------------------------------------------------------------------
    // Running jobs
    // ------------------------------------------------------------------------

    fn on_progress(&mut self, job_id: JobId, attempt: u32, report: ProgressReport) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if entry.job.attempt != attempt {
            return;
        }
        let Some(builder) = entry.builder.as_mut() else {
            return;
        };
        match report {
            ProgressReport::StepCompleted(step) => {
                builder.append(step.clone());
                self.event_bus.publish(JobEvent::StepCompleted { job_id, attempt, step });
            }
            ProgressReport::FileTouched { path, change } => builder.record_file(path, change),
            ProgressReport::BuildStatus(status) => builder.set_build_status(status),
            ProgressReport::NextSteps(steps) => builder.set_next_steps(steps),
            ProgressReport::VerificationStarted => {
                info!(job_id = %job_id, "Post-deploy verification started");
            }
        }
    }

    fn on_soft_deadline(&mut self, job_id: JobId) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if entry.job.state != JobState::Running {
            return;
        }
        entry.degrading = true;
        let Some(checkpoint) = entry.builder.as_ref().map(HandoffBuilder::provisional) else {
            return;
        };
        self.persist.persist(checkpoint.clone());
        self.event_bus.publish(JobEvent::SoftDeadlineReached {
            job_id,
            checkpoint: Box::new(checkpoint),
            reached_at: Utc::now(),
        });
    }

    fn on_preconditions_checked(&mut self, job_id: JobId, result: Result<(), JobError>) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if entry.job.state.is_terminal() || !entry.validating {
            return;
        }
        entry.validating = false;
        match result {
            Ok(()) => {
                entry.preconditions_passed = true;
                debug!(job_id = %job_id, "Preconditions met");
            }
            Err(error) => {
                warn!(job_id = %job_id, error = %error, "Precondition not met, job rejected");
                self.finalize(job_id, JobOutcome::Failed { error });
            }
        }
    }

    fn on_finished(&mut self, job_id: JobId, attempt: u32, outcome: SupervisedOutcome) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if entry.job.state != JobState::Running || entry.job.attempt != attempt {
            return;
        }
        entry.ctx = None;
        entry.degrading = false;
        if let Some(started) = entry.run_started.take() {
            metrics::record_stopped(entry.job.kind, started.elapsed());
        }

        match outcome {
            SupervisedOutcome::Completed(Ok(summary)) => {
                if let Some(builder) = entry.builder.as_mut() {
                    if !summary.next_steps.is_empty() {
                        builder.set_next_steps(summary.next_steps);
                    }
                    if let Some(status) = summary.build_status {
                        builder.set_build_status(status);
                    }
                }
                self.finalize(job_id, JobOutcome::Succeeded);
            }
            SupervisedOutcome::VerifiedByPlatform => {
                if let Some(builder) = entry.builder.as_mut() {
                    builder.append("deployment verified healthy by the platform at the hard deadline");
                }
                self.finalize(job_id, JobOutcome::Succeeded);
            }
            SupervisedOutcome::TimedOut { degraded, limit } => {
                let error = JobError::Timeout {
                    limit_secs: limit.as_secs(),
                    degraded,
                };
                self.finalize(job_id, JobOutcome::TimedOut { error });
            }
            SupervisedOutcome::Completed(Err(error)) => self.on_failure(job_id, error),
        }
    }

    fn on_failure(&mut self, job_id: JobId, error: ExecutorError) {
        let class = self.retry.classify(&error);
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        entry.last_error = Some(error.message.clone());
        if let Some(builder) = entry.builder.as_mut() {
            builder.record_error(error.message.clone());
        }
        let decision = self.retry.record(&mut entry.retry, class);
        let retry_number = entry.retry.as_ref().map_or(0, |r| r.attempts_made);
        let job_error = job_error_for(class, &error, entry.job.attempt);
        // only a ship job has a deployment to roll back
        let decision = match decision {
            RetryDecision::Rollback if entry.job.kind != JobKind::Ship => RetryDecision::Abort,
            other => other,
        };

        warn!(job_id = %job_id, class = %class, decision = ?decision, "Job attempt failed: {}", error);

        match decision {
            RetryDecision::RetryAfter(delay) => {
                self.requeue(job_id);
                let until = Instant::now() + delay;
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(until).await;
                    let _ = tx.send(Internal::BackoffElapsed { job_id });
                });
                self.retry_scheduled(job_id, class, retry_number, delay, &error);
            }
            RetryDecision::RetryImmediately => {
                self.requeue(job_id);
                self.retry_scheduled(job_id, class, retry_number, Duration::ZERO, &error);
            }
            RetryDecision::Rollback => self.start_rollback(job_id, job_error),
            RetryDecision::Abort => self.finalize(job_id, JobOutcome::Failed { error: job_error }),
        }
    }

    fn requeue(&mut self, job_id: JobId) {
        self.locks.release(job_id);
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        entry.job.requeue();
        entry.ticket = None;
        let (kind, urgent) = (entry.job.kind, entry.job.urgent);
        self.queue.push(job_id, kind, urgent);
    }

    fn retry_scheduled(&self, job_id: JobId, class: ErrorClass, retry: u32, delay: Duration, error: &ExecutorError) {
        info!(job_id = %job_id, class = %class, retry, delay_ms = delay.as_millis() as u64, "Retry scheduled");
        metrics::record_retry(class);
        self.event_bus.publish(JobEvent::RetryScheduled {
            job_id,
            class,
            retry,
            delay_ms: delay.as_millis() as u64,
            error: error.message.clone(),
        });
    }

    /// Locks stay held until the platform has rolled back.
    fn start_rollback(&mut self, job_id: JobId, error: JobError) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        entry.rolling_back = true;
        entry.rollback_error = Some(error);
        let job = entry.job.clone();

        info!(job_id = %job_id, "Deploy retries exhausted, rolling back");
        self.event_bus.publish(JobEvent::RollbackStarted {
            job_id,
            started_at: Utc::now(),
        });

        let platform = self.platform.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match platform {
                Some(platform) => platform.rollback(&job).await,
                None => Err(PlatformError::Unavailable(
                    "no deployment platform configured".to_string(),
                )),
            };
            let _ = tx.send(Internal::RollbackFinished { job_id, result });
        });
    }

    fn on_rollback_finished(&mut self, job_id: JobId, result: Result<String, PlatformError>) {
        let corrective_enabled = self.settings.rollback_corrective_job && !self.shutting_down;
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if !entry.rolling_back {
            return;
        }
        entry.rolling_back = false;
        let error = entry.rollback_error.take().unwrap_or_else(|| JobError::Deploy {
            message: entry.last_error.clone().unwrap_or_default(),
            attempts: entry.job.attempt,
        });

        // a corrective job never admits another one
        let follow_up = match entry.job.corrective_of {
            Some(original) => Err(format!(
                "manual intervention required: corrective job for {} also needed a rollback",
                original
            )),
            None if corrective_enabled => Ok(JobId::new()),
            None => Err("manual intervention required: no corrective fix job was admitted".to_string()),
        };
        if let Some(builder) = entry.builder.as_mut() {
            builder.prepend_next_step(match &follow_up {
                Ok(corrective) => format!("corrective fix job {} admitted", corrective),
                Err(manual) => manual.clone(),
            });
        }

        match result {
            Ok(rollback) => {
                info!(job_id = %job_id, rollback = %rollback, "Rollback completed");
                self.finalize(job_id, JobOutcome::RolledBack { error, rollback });
            }
            Err(e) => {
                warn!(job_id = %job_id, "Rollback failed: {}", e);
                if let Some(builder) = entry.builder.as_mut() {
                    builder.set_blocking_issue(format!("rollback failed: {}", e));
                }
                self.finalize(job_id, JobOutcome::Failed { error });
            }
        }

        if let Ok(corrective) = follow_up {
            self.admit_corrective(job_id, corrective);
        }
    }

    fn admit_corrective(&mut self, original: JobId, id: JobId) {
        let Some(entry) = self.jobs.get(&original) else {
            return;
        };
        let mut request = JobRequest::new(JobKind::Fix, entry.job.resources().iter().cloned()).urgent();
        request.feature = entry.job.feature.clone();
        info!(job_id = %id, corrective_of = %original, "Admitting corrective fix job");
        self.admit(id, request, Some(original));
    }

    // ------------------------------------------------------------------------
    // Finalization and status
    // ------------------------------------------------------------------------

    /// Seals the job's handoff and releases everything it held.
    fn finalize(&mut self, job_id: JobId, outcome: JobOutcome) {
        self.locks.release(job_id);
        self.queue.remove(job_id);
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if !entry.job.state.is_terminal() {
            self.finished_order.push_back(job_id);
        }
        let state = outcome.state();
        entry.job.finish(state);
        entry.ticket = None;
        entry.validating = false;
        entry.ctx = None;
        entry.degrading = false;

        let mut builder = entry.builder.take().unwrap_or_else(|| HandoffBuilder::new(&entry.job));
        builder.set_attempts(entry.job.attempt);
        let handoff = builder.finalize(&entry.job, outcome);
        entry.handoff = Some(handoff.clone());
        let (kind, feature, finished_at) = (entry.job.kind, entry.job.feature.clone(), entry.job.ended_at);

        if let Some(feature) = feature {
            self.feature_handoffs.insert(feature, handoff.clone());
        }
        self.persist.persist(handoff.clone());

        info!(job_id = %job_id, kind = %kind, state = %state, "Job finished");
        metrics::record_finished(kind, state);
        self.event_bus.publish(JobEvent::JobFinished {
            job_id,
            state,
            handoff: Box::new(handoff),
            finished_at: finished_at.unwrap_or_else(Utc::now),
        });
        self.evict_finished();
    }

    /// Forgets the oldest finished jobs beyond the retention limit. Their handoffs
    /// stay in the repository.
    fn evict_finished(&mut self) {
        let limit = self.settings.finished_job_retention.max(1);
        if self.finished_order.len() <= limit {
            return;
        }
        let mut evicted = BTreeSet::new();
        while self.finished_order.len() > limit {
            let Some(id) = self.finished_order.pop_front() else {
                break;
            };
            self.jobs.remove(&id);
            evicted.insert(id);
        }
        self.submission_order.retain(|id| !evicted.contains(id));
        debug!(evicted = evicted.len(), "Evicted finished jobs from memory");
    }

    fn status_of(&self, entry: &JobEntry) -> JobStatus {
        let job = &entry.job;
        let handoff = match (&entry.handoff, job.state) {
            (Some(handoff), _) => Some(handoff.clone()),
            (None, JobState::Running) => entry.builder.as_ref().map(HandoffBuilder::provisional),
            (None, _) => None,
        };
        JobStatus {
            job_id: job.id,
            kind: job.kind,
            state: job.state,
            resources: job.resources().clone(),
            urgent: job.urgent,
            feature: job.feature.clone(),
            attempt: job.attempt,
            queue_position: self.queue.position(job.id),
            degrading: entry.degrading,
            locks: self.locks.held_by(job.id).into_iter().collect(),
            corrective_of: job.corrective_of,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            ended_at: job.ended_at,
            handoff,
        }
    }
}

async fn stored_predecessor(handoffs: &dyn HandoffRepository, job: &Job) -> Option<HandoffContext> {
    let found = match (job.corrective_of, &job.feature) {
        (Some(original), _) => handoffs.find_by_job(original).await,
        (None, Some(feature)) => handoffs.latest_for_feature(feature).await,
        (None, None) => return None,
    };
    match found {
        Ok(found) => found,
        Err(e) => {
            warn!(job_id = %job.id, "Could not load predecessor handoff: {}", e);
            None
        }
    }
}

fn job_error_for(class: ErrorClass, error: &ExecutorError, attempts: u32) -> JobError {
    let message = error.message.clone();
    match class {
        ErrorClass::Transient => JobError::Transient { message, attempts },
        ErrorClass::Build => JobError::Build {
            message,
            attempts,
            diagnostic: error.diagnostic.clone(),
        },
        ErrorClass::Deploy => JobError::Deploy { message, attempts },
        ErrorClass::Auth => JobError::Auth { message },
        ErrorClass::Unclassified => {
            let mut context = Vec::new();
            if let Some(code) = error.exit_code {
                context.push(format!("exit code {}", code));
            }
            if let Some(diagnostic) = &error.diagnostic {
                context.push(diagnostic.clone());
            }
            JobError::Unclassified {
                message,
                context: (!context.is_empty()).then(|| context.join("\n")),
            }
        }
    }
}
