// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Baton CLI
//!
//! The `baton` binary coordinates fix, ship, vibe and style jobs that compete for
//! the same files, modules and deployment target.
//!
//! ## Architecture
//!
//! This CLI follows a **CLI-first** design with daemon capabilities:
//!
//! - **Daemon mode**: `baton --daemon` runs the coordinator behind an HTTP API
//! - **Job commands**: `baton job ...` talk to the running daemon
//! - **One-shot mode**: `baton run` embeds a coordinator for a single job
//! - **Detection**: Check PID file + HTTP health check
//!
//! ## Commands
//!
//! - `baton daemon start|stop|status` - Manage daemon lifecycle
//! - `baton job submit|status|list|cancel|wait|events` - Job operations
//! - `baton run <kind> <resources...>` - Run one job in-process
//! - `baton handoff show|get` - Inspect handoff documents
//! - `baton config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use baton_cli::commands::{self, ConfigCommand, DaemonCommand, HandoffCommand, JobCommand, RunArgs};
use baton_cli::daemon;
use baton_core::domain::config::SchedulerConfigManifest;

/// Baton - deterministic coordination for competing code jobs
#[derive(Parser)]
#[command(name = "baton")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Run as background daemon service
    #[arg(long, global = true)]
    daemon: bool,

    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "BATON_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// HTTP API port (default: spec.network.port, 8000)
    #[arg(long, global = true, env = "BATON_PORT")]
    port: Option<u16>,

    /// HTTP API host (default: spec.network.bind_address, 127.0.0.1)
    #[arg(long, global = true, env = "BATON_HOST")]
    host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "BATON_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage daemon lifecycle
    #[command(name = "daemon")]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Submit and inspect jobs on the daemon
    #[command(name = "job")]
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },

    /// Run a single job in-process and print its handoff
    #[command(name = "run")]
    Run(RunArgs),

    /// Inspect handoff documents
    #[command(name = "handoff")]
    Handoff {
        #[command(subcommand)]
        command: HandoffCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging and endpoint defaults come from the config when it loads; a broken
    // config is reported by whichever command actually needs it.
    let config = SchedulerConfigManifest::load_or_default(cli.config.clone()).ok();
    let logging = config
        .as_ref()
        .map(|c| c.spec.observability.logging.clone())
        .unwrap_or_default();
    let network = config
        .as_ref()
        .map(|c| c.spec.network.clone())
        .unwrap_or_default();

    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, &logging.format)?;

    let host = cli.host.clone().unwrap_or(network.bind_address);
    let port = cli.port.unwrap_or(network.port);

    // Handle daemon mode (background service)
    if cli.daemon {
        info!("Starting Baton coordinator in daemon mode");
        return daemon::start_daemon(cli.config, host, port).await;
    }

    match cli.command {
        Some(Commands::Daemon { command }) => {
            commands::daemon::handle_command(command, cli.config, &host, port).await
        }
        Some(Commands::Job { command }) => {
            commands::job::handle_command(command, cli.config, &host, port).await
        }
        Some(Commands::Run(args)) => commands::run::handle_command(args, cli.config).await,
        Some(Commands::Handoff { command }) => {
            commands::handoff::handle_command(command, &host, port).await
        }
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
