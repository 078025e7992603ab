// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Deployment platform driven by two shell commands.
//!
//! The status command exits 0 when the deployment is healthy and 75 (`EX_TEMPFAIL`) while
//! it is still rolling out; any other exit is a failure whose stderr becomes the detail.
//! The rollback command's stdout is reported as the rollback outcome.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

use crate::domain::config::DeploymentConfig;
use crate::domain::deployment::{DeploymentPlatform, DeploymentStatus, PlatformError};
use crate::domain::job::Job;
use crate::infrastructure::process::{run_captured, shell_command, tail};

const EX_TEMPFAIL: i32 = 75;

pub struct CommandDeploymentPlatform {
    shell: String,
    status_command: String,
    rollback_command: String,
    workdir: Option<PathBuf>,
}

impl CommandDeploymentPlatform {
    pub fn new(config: &DeploymentConfig, shell: &str, workdir: Option<PathBuf>) -> Self {
        Self {
            shell: shell.to_string(),
            status_command: config.status_command.clone(),
            rollback_command: config.rollback_command.clone(),
            workdir,
        }
    }

    fn env_for(job: &Job) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("BATON_JOB_ID".to_string(), job.id.to_string());
        env.insert(
            "BATON_RESOURCES".to_string(),
            job.resources().iter().cloned().collect::<Vec<_>>().join("\n"),
        );
        env
    }
}

#[async_trait]
impl DeploymentPlatform for CommandDeploymentPlatform {
    async fn status(&self, job: &Job) -> Result<DeploymentStatus, PlatformError> {
        let cmd = shell_command(
            &self.shell,
            &self.status_command,
            self.workdir.as_deref(),
            &Self::env_for(job),
        );
        let output = run_captured(cmd)
            .await
            .map_err(|e| PlatformError::Unavailable(e.to_string()))?;
        Ok(match output.exit_code {
            Some(0) => DeploymentStatus::Healthy,
            Some(EX_TEMPFAIL) => DeploymentStatus::InProgress,
            Some(_) => DeploymentStatus::Failed(tail(&output.stderr, 5)),
            None => DeploymentStatus::Unknown,
        })
    }

    async fn rollback(&self, job: &Job) -> Result<String, PlatformError> {
        info!(job_id = %job.id, "Running rollback command");
        let cmd = shell_command(
            &self.shell,
            &self.rollback_command,
            self.workdir.as_deref(),
            &Self::env_for(job),
        );
        let output = run_captured(cmd)
            .await
            .map_err(|e| PlatformError::Unavailable(e.to_string()))?;
        if output.success() {
            let report = output.stdout.trim();
            Ok(if report.is_empty() {
                "rolled back to last known-good release".to_string()
            } else {
                report.to_string()
            })
        } else {
            Err(PlatformError::RollbackFailed(tail(&output.stderr, 5)))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::job::{JobId, JobKind, JobRequest};

    fn platform(status: &str, rollback: &str) -> CommandDeploymentPlatform {
        let config = DeploymentConfig {
            status_command: status.to_string(),
            rollback_command: rollback.to_string(),
        };
        CommandDeploymentPlatform::new(&config, "sh", None)
    }

    fn ship() -> Job {
        Job::new(JobId::new(), JobRequest::new(JobKind::Ship, ["deploy/prod"]))
    }

    #[tokio::test]
    async fn test_status_maps_exit_codes() {
        assert_eq!(platform("exit 0", "true").status(&ship()).await.unwrap(), DeploymentStatus::Healthy);
        assert_eq!(
            platform("exit 75", "true").status(&ship()).await.unwrap(),
            DeploymentStatus::InProgress
        );
        assert_eq!(
            platform("echo 'pods crashlooping' >&2; exit 1", "true")
                .status(&ship())
                .await
                .unwrap(),
            DeploymentStatus::Failed("pods crashlooping".into())
        );
    }

    #[tokio::test]
    async fn test_rollback_reports_stdout_or_failure() {
        let ok = platform("true", "echo restored v41").rollback(&ship()).await.unwrap();
        assert_eq!(ok, "restored v41");

        let err = platform("true", "echo 'no previous release' >&2; exit 1")
            .rollback(&ship())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::RollbackFailed(detail) if detail == "no previous release"));
    }
}
