// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `baton run`: execute a single job with an in-process coordinator
//!
//! No daemon is needed. The job's events are printed as they happen and its final
//! handoff is rendered once it finishes.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tracing::debug;

use baton_core::{domain::job::JobState, infrastructure::event_bus::EventBusError};

use super::job::{print_event, print_summary, JobSpecArgs};
use crate::embedded::EmbeddedCoordinator;

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub job: JobSpecArgs,

    /// Print the final handoff as JSON instead of markdown
    #[arg(long)]
    pub json: bool,
}

pub async fn handle_command(args: RunArgs, config_path: Option<PathBuf>) -> Result<()> {
    let coordinator = EmbeddedCoordinator::new(config_path).await?;
    let handle = coordinator.handle().clone();

    // subscribe before submitting so no event for the new job is missed
    let mut events = handle.event_bus().subscribe();
    let job_id = handle
        .submit(args.job.to_request())
        .context("Failed to submit job")?;

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.job_id() == job_id => {
                    print_event(&event);
                    if event.is_terminal() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(EventBusError::Lagged(n)) => debug!("Event printer lagged by {} events", n),
                Err(_) => break,
            }
        }
    });

    let status = tokio::select! {
        status = handle.wait_until_finished(job_id) => status?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, letting the job wind down...");
            coordinator.shutdown().await;
            printer.abort();
            if let Some(handoff) = coordinator.handoffs().find_by_job(job_id).await? {
                println!();
                println!("{}", handoff.render_markdown());
            }
            std::process::exit(130);
        }
    };
    let _ = printer.await;

    print_summary(&status);
    if let Some(handoff) = &status.handoff {
        println!();
        if args.json {
            println!("{}", handoff.to_json_pretty()?);
        } else {
            println!("{}", handoff.render_markdown());
        }
    }

    coordinator.shutdown().await;

    if status.state != JobState::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}
