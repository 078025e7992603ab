// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Job commands against a running daemon
//!
//! Commands: submit, status, list, cancel, wait, events

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::{ColoredString, Colorize};
use std::path::PathBuf;

use baton_core::{
    application::JobStatus,
    domain::{
        events::JobEvent,
        job::{JobId, JobKind, JobRequest, JobState},
    },
};

use crate::daemon::{check_daemon_running, DaemonClient, DaemonStatus};

/// Job description shared by `job submit` and `run`.
#[derive(Args, Debug, Clone)]
pub struct JobSpecArgs {
    /// Job kind (fix, ship, vibe, style)
    #[arg(value_name = "KIND")]
    pub kind: JobKind,

    /// Resources the job touches (files, modules, the deployment target)
    #[arg(value_name = "RESOURCE", required = true)]
    pub resources: Vec<String>,

    /// Jump ahead of other jobs of the same kind
    #[arg(long)]
    pub urgent: bool,

    /// Feature name; a new job on the same feature resumes from its last handoff
    #[arg(long)]
    pub feature: Option<String>,
}

impl JobSpecArgs {
    pub fn to_request(&self) -> JobRequest {
        let mut request = JobRequest::new(self.kind, self.resources.iter().cloned());
        if self.urgent {
            request = request.urgent();
        }
        if let Some(feature) = &self.feature {
            request = request.with_feature(feature.clone());
        }
        request
    }
}

#[derive(Subcommand)]
pub enum JobCommand {
    /// Submit a job to the daemon
    Submit {
        #[command(flatten)]
        job: JobSpecArgs,

        /// Follow the job's events until it finishes
        #[arg(short, long)]
        follow: bool,
    },

    /// Show a job's state, locks and progress
    Status {
        job_id: String,

        /// Print the raw status as JSON
        #[arg(long)]
        json: bool,
    },

    /// List all known jobs
    List,

    /// Cancel a queued or waiting job
    Cancel { job_id: String },

    /// Block until a job finishes and print its handoff
    Wait { job_id: String },

    /// Stream coordinator events
    Events {
        /// Only events for this job
        #[arg(long)]
        job: Option<String>,
    },
}

pub async fn handle_command(
    command: JobCommand,
    _config_path: Option<PathBuf>,
    host: &str,
    port: u16,
) -> Result<()> {
    let client = connect(host, port).await?;

    match command {
        JobCommand::Submit { job, follow } => submit(&client, job, follow).await,
        JobCommand::Status { job_id, json } => status(&client, parse_job_id(&job_id)?, json).await,
        JobCommand::List => list(&client).await,
        JobCommand::Cancel { job_id } => cancel(&client, parse_job_id(&job_id)?).await,
        JobCommand::Wait { job_id } => wait(&client, parse_job_id(&job_id)?).await,
        JobCommand::Events { job } => {
            let job_id = job.as_deref().map(parse_job_id).transpose()?;
            client
                .events(job_id, |event| {
                    print_event(&event);
                    true
                })
                .await
        }
    }
}

async fn connect(host: &str, port: u16) -> Result<DaemonClient> {
    match check_daemon_running(host, port).await {
        Ok(DaemonStatus::Running { .. }) => DaemonClient::new(host, port),
        Ok(DaemonStatus::Unhealthy { pid, error }) => anyhow::bail!(
            "Daemon (PID {}) is unhealthy: {}. Restart it with 'baton daemon stop && baton daemon start'",
            pid,
            error
        ),
        Ok(DaemonStatus::Stopped) | Err(_) => anyhow::bail!(
            "Daemon is not running. Start it with 'baton daemon start', or run a single job in-process with 'baton run'"
        ),
    }
}

pub(crate) fn parse_job_id(raw: &str) -> Result<JobId> {
    JobId::from_string(raw).with_context(|| format!("Invalid job ID '{}'", raw))
}

async fn submit(client: &DaemonClient, job: JobSpecArgs, follow: bool) -> Result<()> {
    let job_id = client.submit(&job.to_request()).await?;
    println!("{}", format!("✓ Job submitted: {}", job_id).green());

    if follow {
        let status = client.wait(job_id, print_event).await?;
        print_summary(&status);
        if status.state != JobState::Succeeded {
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn status(client: &DaemonClient, job_id: JobId, json: bool) -> Result<()> {
    let status = client.status(job_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{} {}", "Job".bold(), status.job_id);
    println!("  Kind: {}", status.kind);
    println!("  State: {}", format_state(status.state));
    println!("  Resources: {}", join(&status.resources));
    if status.urgent {
        println!("  Urgent: yes");
    }
    if let Some(feature) = &status.feature {
        println!("  Feature: {}", feature);
    }
    println!("  Attempt: {}", status.attempt);
    if let Some(position) = status.queue_position {
        println!("  Queue position: {}", position);
    }
    if !status.locks.is_empty() {
        println!("  Locks held: {}", status.locks.join(", "));
    }
    if status.degrading {
        println!("  {}", "Soft deadline passed, winding down".yellow());
    }
    if let Some(original) = status.corrective_of {
        println!("  Corrects: {}", original);
    }
    println!("  Submitted: {}", status.submitted_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(started) = status.started_at {
        println!("  Started: {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ended) = status.ended_at {
        println!("  Ended: {}", ended.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(handoff) = &status.handoff {
        println!(
            "  Progress: {}/{} steps",
            handoff.completed_steps().len(),
            handoff.completed_steps().len() + handoff.next_steps().len()
        );
        if let Some(issue) = handoff.blocking_issue() {
            println!("  Blocking issue: {}", issue.red());
        }
    }

    Ok(())
}

async fn list(client: &DaemonClient) -> Result<()> {
    let jobs = client.list().await?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!(
        "{:<36} {:<6} {:<12} {:<8} {}",
        "ID", "KIND", "STATE", "ATTEMPT", "RESOURCES"
    );
    println!("{}", "-".repeat(90));
    for job in jobs {
        println!(
            "{:<36} {:<6} {:<12} {:<8} {}",
            job.job_id.to_string(),
            job.kind.as_str(),
            format_state(job.state),
            job.attempt,
            join(&job.resources)
        );
    }

    Ok(())
}

async fn cancel(client: &DaemonClient, job_id: JobId) -> Result<()> {
    client.cancel(job_id).await?;
    println!("{}", format!("✓ Job {} cancelled", job_id).green());
    Ok(())
}

async fn wait(client: &DaemonClient, job_id: JobId) -> Result<()> {
    let status = client.wait(job_id, print_event).await?;
    print_summary(&status);
    if let Some(handoff) = &status.handoff {
        println!();
        println!("{}", handoff.render_markdown());
    }
    if status.state != JobState::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

pub(crate) fn print_summary(status: &JobStatus) {
    println!(
        "Job {} finished: {} (attempt {})",
        status.job_id,
        format_state(status.state),
        status.attempt
    );
}

/// One line per event, for `--follow`, `wait`, `events` and `run`.
pub(crate) fn print_event(event: &JobEvent) {
    let id = short_id(event.job_id());
    let line = match event {
        JobEvent::JobSubmitted { kind, resources, urgent, .. } => format!(
            "submitted {}{} on [{}]",
            kind,
            if *urgent { " (urgent)" } else { "" },
            join(resources)
        ),
        JobEvent::JobWaiting { blocked_by, reason, .. } => {
            let holders: Vec<String> = blocked_by.iter().map(|id| short_id(*id)).collect();
            if holders.is_empty() {
                format!("waiting: {}", reason)
            } else {
                format!("waiting on {}: {}", holders.join(", "), reason)
            }
        }
        JobEvent::JobPreempted { preempted_by, .. } => {
            format!("preempted by {}", short_id(*preempted_by)).yellow().to_string()
        }
        JobEvent::JobStarted { kind, attempt, .. } => {
            format!("started {} (attempt {})", kind, attempt)
        }
        JobEvent::StepCompleted { step, .. } => format!("✓ {}", step),
        JobEvent::SoftDeadlineReached { .. } => {
            "soft deadline reached, winding down".yellow().to_string()
        }
        JobEvent::VerificationExtended { extension, extended_until, .. } => format!(
            "verification extended (#{}) until {}",
            extension,
            extended_until.format("%H:%M:%S")
        ),
        JobEvent::RetryScheduled { class, retry, delay_ms, error, .. } => format!(
            "{} error, retry {} in {}ms: {}",
            class.as_str(),
            retry,
            delay_ms,
            error
        )
        .yellow()
        .to_string(),
        JobEvent::RollbackStarted { .. } => "rolling back deployment".red().to_string(),
        JobEvent::JobFinished { state, .. } => format!("finished: {}", format_state(*state)),
    };
    println!("{} {}", format!("[{}]", id).dimmed(), line);
}

pub(crate) fn format_state(state: JobState) -> ColoredString {
    let label = state.as_str();
    match state {
        JobState::Succeeded => label.green(),
        JobState::Failed | JobState::TimedOut | JobState::RolledBack => label.red(),
        JobState::Cancelled => label.dimmed(),
        JobState::Running => label.cyan(),
        JobState::Queued | JobState::Waiting => label.yellow(),
    }
}

fn short_id(id: JobId) -> String {
    id.to_string().chars().take(8).collect()
}

fn join<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    items.into_iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}
