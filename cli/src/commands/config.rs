// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use baton_core::domain::{
    config::SchedulerConfigManifest,
    job::JobKind,
    retry::{Backoff, ClassRetryPolicy},
};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./baton-config.yaml)
        #[arg(short, long, default_value = "./baton-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = SchedulerConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. BATON_CONFIG_PATH: {}",
            std::env::var("BATON_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./baton-config.yaml");
        println!("  4. ~/.baton/config.yaml");
        println!("  5. /etc/baton/config.yaml");
        println!();
    }

    let spec = &config.spec;

    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Scheduling:".bold());
    let order: Vec<&str> = spec.priority_order.iter().map(JobKind::as_str).collect();
    println!("  Priority order: {}", order.join(" > "));
    println!("  Schema resources: {}", spec.schema_resources.join(", "));
    println!(
        "  Corrective fix after rollback: {}",
        if spec.rollback_corrective_job { "yes" } else { "no" }
    );
    println!("  Finished jobs retained: {}", spec.finished_job_retention);
    println!(
        "  Verification: {} extension(s) of {}s",
        spec.verification.max_extensions,
        spec.verification.extension.as_secs()
    );
    println!();

    println!("{}", "Job kinds:".bold());
    for kind in JobKind::ALL {
        let policy = spec.kind_policy(kind);
        let ceiling = policy
            .max_concurrent
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unlimited".to_string());
        let preconditions: Vec<&str> = policy.preconditions.iter().map(|p| p.as_str()).collect();
        println!("  {}", kind.as_str().bold());
        println!("    Max concurrent: {}", ceiling);
        println!(
            "    Deadlines: soft {}s, hard {}s",
            policy.timeout.soft.as_secs(),
            policy.timeout.hard.as_secs()
        );
        if !preconditions.is_empty() {
            println!("    Preconditions: {}", preconditions.join(", "));
        }
        match spec.executors.commands.get(&kind) {
            Some(command) => println!("    Executor: {}", command),
            None => println!("    Executor: {}", "(not configured)".dimmed()),
        }
    }
    println!();

    println!("{}", "Retry policy:".bold());
    for (class, policy) in [
        ("transient", &spec.retry.transient),
        ("build", &spec.retry.build),
        ("deploy", &spec.retry.deploy),
        ("auth", &spec.retry.auth),
        ("unclassified", &spec.retry.unclassified),
    ] {
        println!("  {}: {}", class, describe_retry(policy));
    }
    println!();

    println!("{}", "Workspace:".bold());
    match &spec.workspace.root {
        Some(root) => println!("  Root: {}", root.display()),
        None => println!("  Root: {}", "(not set, preconditions skipped)".dimmed()),
    }
    if let Some(build) = &spec.workspace.build_command {
        println!("  Build command: {}", build);
    }
    println!("  Git checks: {}", if spec.workspace.git { "on" } else { "off" });
    if let Some(deployment) = &spec.deployment {
        println!("  Deployment status: {}", deployment.status_command);
        println!("  Deployment rollback: {}", deployment.rollback_command);
    }
    match &spec.handoff_dir {
        Some(dir) => println!("  Handoff directory: {}", dir.display()),
        None => println!("  Handoff directory: {}", "(in-memory)".dimmed()),
    }
    println!();

    println!("{}", "Daemon:".bold());
    println!(
        "  API: {}:{}",
        spec.network.bind_address, spec.network.port
    );
    println!(
        "  Logging: {} ({})",
        spec.observability.logging.level, spec.observability.logging.format
    );
    if spec.observability.metrics.enabled {
        println!("  Metrics: enabled on port {}", spec.observability.metrics.port);
    } else {
        println!("  Metrics: {}", "disabled".dimmed());
    }
    println!();

    Ok(())
}

fn describe_retry(policy: &ClassRetryPolicy) -> String {
    if policy.max_retries == 0 {
        return format!("no retry, then {:?}", policy.on_exhausted).to_lowercase();
    }
    let backoff = match &policy.backoff {
        Backoff::None => "immediately".to_string(),
        Backoff::Exponential { initial, multiplier } => {
            format!("backoff {}s x{}", initial.as_secs(), multiplier)
        }
    };
    format!(
        "{} retries {}, then {:?}",
        policy.max_retries, backoff, policy.on_exhausted
    )
    .to_lowercase()
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = SchedulerConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_templates_are_valid_manifests() {
        for template in [
            include_str!("../../templates/config-minimal.yaml"),
            include_str!("../../templates/config-with-examples.yaml"),
        ] {
            let manifest = SchedulerConfigManifest::from_yaml_str(template).unwrap();
            manifest.validate().unwrap();
        }
    }

    #[test]
    fn test_describe_retry() {
        assert_eq!(describe_retry(&ClassRetryPolicy::never()), "no retry, then abort");
        let policy = ClassRetryPolicy {
            max_retries: 3,
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(1),
                multiplier: 2,
            },
            on_exhausted: Default::default(),
        };
        assert_eq!(describe_retry(&policy), "3 retries backoff 1s x2, then abort");
    }
}
