// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Handoff inspection commands
//!
//! Commands: show, get

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::PathBuf;

use baton_core::domain::handoff::HandoffContext;

use super::job::parse_job_id;
use crate::daemon::DaemonClient;

#[derive(Subcommand)]
pub enum HandoffCommand {
    /// Render a handoff document stored on disk
    Show {
        /// Path to a `<job_id>.json` handoff file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print JSON instead of markdown
        #[arg(long)]
        json: bool,
    },

    /// Fetch the final handoff of a job from the daemon
    Get {
        job_id: String,

        /// Print JSON instead of markdown
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: HandoffCommand, host: &str, port: u16) -> Result<()> {
    match command {
        HandoffCommand::Show { file, json } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read handoff file {:?}", file))?;
            let handoff = HandoffContext::from_json(&content)
                .with_context(|| format!("Failed to parse handoff file {:?}", file))?;
            print_handoff(&handoff, json)
        }
        HandoffCommand::Get { job_id, json } => {
            let client = DaemonClient::new(host, port)?;
            let handoff = client.handoff(parse_job_id(&job_id)?).await?;
            print_handoff(&handoff, json)
        }
    }
}

fn print_handoff(handoff: &HandoffContext, json: bool) -> Result<()> {
    if json {
        println!("{}", handoff.to_json_pretty()?);
    } else {
        println!("{}", handoff.render_markdown());
    }
    Ok(())
}
