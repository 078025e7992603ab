// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Workspace inspector backed by the configured build command and `git status`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::config::WorkspaceConfig;
use crate::domain::precondition::{InspectorError, WorkspaceInspector};
use crate::infrastructure::process::{run_captured, shell_command, tail, DIAGNOSTIC_TAIL_LINES};

pub struct CommandWorkspaceInspector {
    root: PathBuf,
    shell: String,
    build_command: Option<String>,
    git: bool,
}

impl CommandWorkspaceInspector {
    /// `None` when no workspace root is configured.
    pub fn from_config(config: &WorkspaceConfig, shell: &str) -> Option<Self> {
        let root = config.root.clone()?;
        Some(Self {
            root,
            shell: shell.to_string(),
            build_command: config.build_command.clone(),
            git: config.git,
        })
    }
}

#[async_trait]
impl WorkspaceInspector for CommandWorkspaceInspector {
    async fn build_errors(&self) -> Result<Vec<String>, InspectorError> {
        let Some(command) = &self.build_command else {
            return Ok(Vec::new());
        };
        let cmd = shell_command(&self.shell, command, Some(&self.root), &HashMap::new());
        let output = run_captured(cmd)
            .await
            .map_err(|e| InspectorError(format!("build command '{}': {}", command, e)))?;
        if output.success() {
            return Ok(Vec::new());
        }
        debug!(exit_code = ?output.exit_code, "Build command reported errors");
        let combined = format!("{}\n{}", output.stdout, output.stderr);
        let lines: Vec<String> = tail(&combined, DIAGNOSTIC_TAIL_LINES)
            .lines()
            .map(str::to_string)
            .collect();
        if lines.is_empty() {
            Ok(vec![format!("'{}' exited with {:?}", command, output.exit_code)])
        } else {
            Ok(lines)
        }
    }

    async fn uncommitted_changes(&self) -> Result<Vec<String>, InspectorError> {
        if !self.git {
            return Ok(Vec::new());
        }
        let mut cmd = tokio::process::Command::new("git");
        cmd.args(["status", "--porcelain"]).current_dir(&self.root);
        let output = run_captured(cmd)
            .await
            .map_err(|e| InspectorError(format!("git status: {}", e)))?;
        if !output.success() {
            return Err(InspectorError(format!("git status failed: {}", output.stderr.trim())));
        }
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.get(3..))
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .collect())
    }
}
